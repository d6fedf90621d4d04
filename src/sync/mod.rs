//! Turns decoded feed records into storage mutations.
//!
//! Work happens in two stages. [`classify`] compares each incoming record
//! with its stored row and decides what kind of write it needs; the caller
//! then fetches photos for every record that needs them, and
//! [`build_mutation`] produces the final parameterized statement.

use tracing::trace;

use crate::models::{columns, FieldValue, MutationClause, PropertyRecord, StoredListing};
use crate::photos::{PhotoMap, PhotoStatus};
use crate::schema::{quote_ident, SchemaDescriptor};

mod price;

pub use price::{seed_price, track_price};

/// The write an incoming record needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// No stored row for this key.
    Create,
    /// Stored row exists and the feed reports a newer photo timestamp.
    UpdateWithPhotos(StoredListing),
    /// Stored row exists and its photos are current.
    UpdateNoPhotos(StoredListing),
}

impl Decision {
    pub fn needs_photos(&self) -> bool {
        matches!(self, Self::Create | Self::UpdateWithPhotos(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::UpdateWithPhotos(_) => "update_with_photos",
            Self::UpdateNoPhotos(_) => "update_no_photos",
        }
    }
}

/// A record paired with the decision made for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub record: PropertyRecord,
    pub decision: Decision,
}

impl Classified {
    pub fn mls(&self) -> Option<String> {
        self.record.mls()
    }
}

pub fn classify(record: PropertyRecord, existing: Option<StoredListing>) -> Classified {
    let decision = match existing {
        None => Decision::Create,
        Some(stored) => {
            let incoming = record.text(columns::PHOTO_UPDATED);
            if incoming != stored.photo_updated {
                Decision::UpdateWithPhotos(stored)
            } else {
                Decision::UpdateNoPhotos(stored)
            }
        }
    };
    Classified { record, decision }
}

/// Lowercased `Street StreetName StreetAbbreviation Area Province Canada`
/// with commas removed; missing parts become empty.
pub fn search_address(record: &PropertyRecord) -> String {
    ["Street", "StreetName", "StreetAbbreviation", "Area", "Province"]
        .iter()
        .map(|field| record.text(field).unwrap_or_default())
        .chain(std::iter::once("Canada".to_string()))
        .collect::<Vec<_>>()
        .join(" ")
        .replace(',', "")
        .to_lowercase()
}

fn set_photos(record: &mut PropertyRecord, links: &[&str]) {
    let json = serde_json::to_string(links).unwrap_or_else(|_| "[]".to_string());
    record.set(columns::PHOTO_COUNT, FieldValue::Int(links.len() as i64));
    record.set(columns::PHOTO_LINK, FieldValue::Text(json));
}

/// Builds the INSERT or UPDATE for one classified record.
///
/// Columns come from `schema`; record fields it does not declare are not
/// written. When the listing's photo batch failed, an update keeps the stored
/// photo columns and photo timestamp so the next run fetches them again.
pub fn build_mutation(
    classified: Classified,
    photos: &PhotoMap,
    schema: &SchemaDescriptor,
) -> MutationClause {
    let Classified { mut record, decision } = classified;
    let mls = record.mls().unwrap_or_default();
    let status = photos.status(&mls);
    record.set(
        columns::SEARCH_ADDRESS,
        FieldValue::Text(search_address(&record)),
    );

    let write_photos = match (&decision, &status) {
        (Decision::Create, PhotoStatus::Fetched(links)) => {
            set_photos(&mut record, links);
            true
        }
        (Decision::Create, PhotoStatus::Unavailable) => {
            set_photos(&mut record, &[]);
            record.set(columns::PHOTO_UPDATED, FieldValue::Null);
            true
        }
        (Decision::UpdateWithPhotos(_), PhotoStatus::Fetched(links)) => {
            set_photos(&mut record, links);
            true
        }
        (Decision::UpdateWithPhotos(stored), PhotoStatus::Unavailable) => {
            record.set(
                columns::PHOTO_UPDATED,
                FieldValue::from_option(stored.photo_updated.clone()),
            );
            false
        }
        (Decision::UpdateNoPhotos(_), _) => false,
    };

    trace!(mls = %mls, decision = decision.label(), write_photos, "building mutation");

    match decision {
        Decision::Create => {
            seed_price(&mut record);
            insert(&record, schema)
        }
        Decision::UpdateWithPhotos(stored) | Decision::UpdateNoPhotos(stored) => {
            track_price(&mut record, &stored);
            update(&record, schema, &mls, write_photos)
        }
    }
}

fn insert(record: &PropertyRecord, schema: &SchemaDescriptor) -> MutationClause {
    let names: Vec<&str> = schema.columns().collect();
    let params = names
        .iter()
        .map(|c| record.get(c).cloned().unwrap_or_default())
        .collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(schema.table_name()),
        names.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        vec!["?"; names.len()].join(", ")
    );
    MutationClause::new(sql, params)
}

fn update(
    record: &PropertyRecord,
    schema: &SchemaDescriptor,
    mls: &str,
    write_photos: bool,
) -> MutationClause {
    let names: Vec<&str> = schema
        .columns()
        .filter(|c| *c != columns::MLS)
        .filter(|c| write_photos || (*c != columns::PHOTO_COUNT && *c != columns::PHOTO_LINK))
        .collect();

    let mut params: Vec<FieldValue> = names
        .iter()
        .map(|c| record.get(c).cloned().unwrap_or_default())
        .collect();
    params.push(FieldValue::Text(mls.to_string()));

    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote_ident(schema.table_name()),
        names
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", "),
        quote_ident(columns::MLS)
    );
    MutationClause::new(sql, params)
}

/// Record fields the schema has no column for.
pub fn undeclared_fields<'a>(
    record: &'a PropertyRecord,
    schema: &'a SchemaDescriptor,
) -> impl Iterator<Item = &'a str> {
    record
        .iter()
        .map(|(name, _)| name)
        .filter(move |name| !schema.has_column(name))
}
