use std::cmp::Ordering;

use tracing::debug;

use crate::models::{columns, FieldValue, PriceTracker, PropertyRecord, StoredListing};

fn parse_price(raw: &str) -> Option<f64> {
    raw.trim().replace(',', "").parse().ok()
}

fn compare(a: &str, b: &str) -> Option<Ordering> {
    parse_price(a)?.partial_cmp(&parse_price(b)?)
}

fn differs(incoming: Option<&str>, stored: Option<&str>) -> bool {
    match (incoming, stored) {
        (Some(a), Some(b)) => match compare(a, b) {
            Some(ordering) => ordering != Ordering::Equal,
            None => a.trim() != b.trim(),
        },
        (a, b) => a != b,
    }
}

/// Carries the stored price history forward onto an updated record.
///
/// When the incoming `ListPrice` differs from the stored one, a
/// `[ListPrice, TimestampSql]` pair is appended and the extremes move if the
/// new price reaches them. Ties reassign the extreme to the same value.
pub fn track_price(record: &mut PropertyRecord, stored: &StoredListing) {
    let incoming = record.text(columns::LIST_PRICE);
    let mut tracker = stored.price_tracker.clone();
    let mut min = stored.min_list_price.clone();
    let mut max = stored.max_list_price.clone();

    if differs(incoming.as_deref(), stored.list_price.as_deref()) {
        if let Some(price) = incoming {
            debug!(
                mls = %stored.mls,
                from = ?stored.list_price,
                to = %price,
                "list price changed"
            );
            tracker.push(price.clone(), record.text(columns::TIMESTAMP_SQL));

            let reaches = |extreme: &Option<String>, wanted: Ordering| match extreme {
                None => true,
                Some(current) => compare(&price, current)
                    .is_some_and(|o| o == wanted || o == Ordering::Equal),
            };
            if reaches(&min, Ordering::Less) {
                min = Some(price.clone());
            }
            if reaches(&max, Ordering::Greater) {
                max = Some(price.clone());
            }
        }
    }

    record.set(columns::MIN_LIST_PRICE, FieldValue::from_option(min));
    record.set(columns::MAX_LIST_PRICE, FieldValue::from_option(max));
    record.set(columns::PRICE_TRACKER, FieldValue::Text(tracker.to_json()));
}

/// Seeds the price columns of a listing seen for the first time.
pub fn seed_price(record: &mut PropertyRecord) {
    let price = record
        .get(columns::LIST_PRICE)
        .cloned()
        .unwrap_or_default();
    record.set(columns::MIN_LIST_PRICE, price.clone());
    record.set(columns::MAX_LIST_PRICE, price);
    record.set(
        columns::PRICE_TRACKER,
        FieldValue::Text(PriceTracker::default().to_json()),
    );
}
