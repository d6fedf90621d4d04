use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::Row;

use listing_sync::feed::{Credentials, FeedClient, PhotoPayload, ReplyError, Session};
use listing_sync::layout::DataLayout;
use listing_sync::models::{PriceTracker, PropertyGroup, PropertyType};
use listing_sync::schema::{quote_ident, SchemaDescriptor};
use listing_sync::service::SyncService;
use listing_sync::storage::Storage;
use listing_sync::{Result, SyncError};

#[derive(Default)]
struct FeedState {
    records: HashMap<PropertyType, String>,
    active: HashMap<PropertyType, String>,
    search_calls: Vec<PropertyType>,
    photo_batches: Vec<Vec<String>>,
    reject_sessions: bool,
    active_reply_error: Option<String>,
}

/// In-memory feed serving canned documents.
#[derive(Default, Clone)]
struct FakeFeed {
    state: Arc<Mutex<FeedState>>,
}

impl FakeFeed {
    fn set_records(&self, property_type: PropertyType, listings: &[Listing]) {
        let xml = document(property_type, listings);
        self.state.lock().unwrap().records.insert(property_type, xml);
    }

    fn set_raw_records(&self, property_type: PropertyType, xml: &str) {
        self.state
            .lock()
            .unwrap()
            .records
            .insert(property_type, xml.to_string());
    }

    fn set_active(&self, property_type: PropertyType, keys: &[&str]) {
        let listings: Vec<Listing> = keys.iter().map(|k| Listing::new(k, "1", "x")).collect();
        let xml = document(property_type, &listings);
        self.state.lock().unwrap().active.insert(property_type, xml);
    }
}

const METADATA: &str = r#"<RETS ReplyCode="0"><METADATA><METADATA-TABLE>
  <Field><StandardName>MLS</StandardName></Field>
  <Field><StandardName>ListPrice</StandardName></Field>
  <Field><StandardName>PixUpdtedDt</StandardName></Field>
  <Field><StandardName>Street</StandardName></Field>
  <Field><StandardName>Street Name</StandardName></Field>
  <Field><StandardName>Pool</StandardName></Field>
  <Field><StandardName>TimestampSql</StandardName></Field>
</METADATA-TABLE></METADATA></RETS>"#;

#[async_trait]
impl FeedClient for FakeFeed {
    async fn fetch_metadata(&self, _: &mut Session, _: PropertyType) -> Result<String> {
        Ok(METADATA.to_string())
    }

    async fn fetch_records_since(
        &self,
        session: &mut Session,
        property_type: PropertyType,
        _since: &str,
    ) -> Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        state.search_calls.push(property_type);
        if state.reject_sessions {
            return Err(SyncError::FeedAuth {
                username: session.username().to_string(),
                reason: "session rejected".into(),
            });
        }
        Ok(state.records.get(&property_type).cloned())
    }

    async fn fetch_active_listing_keys(
        &self,
        _: &mut Session,
        property_type: PropertyType,
    ) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        if let Some(code) = &state.active_reply_error {
            return Err(SyncError::transport(
                format!("search {property_type}"),
                ReplyError {
                    code: code.clone(),
                    text: "Miscellaneous search error.".into(),
                },
            ));
        }
        Ok(state.active.get(&property_type).cloned())
    }

    async fn fetch_photo_batch(&self, _: &mut Session, keys: &[String]) -> Result<PhotoPayload> {
        self.state.lock().unwrap().photo_batches.push(keys.to_vec());

        let mut body = Vec::new();
        for key in keys {
            for seq in [2, 1] {
                body.extend_from_slice(b"--B\r\n");
                body.extend_from_slice(
                    format!("Content-Type: image/jpeg\r\nContent-ID: {key}\r\nObject-ID: {seq}\r\n\r\n")
                        .as_bytes(),
                );
                body.extend_from_slice(format!("{key}:{seq}\r\n").as_bytes());
            }
        }
        body.extend_from_slice(b"--B--\r\n");

        Ok(PhotoPayload {
            content_type: Some("multipart/parallel; boundary=B".into()),
            body: Bytes::from(body),
        })
    }
}

struct Listing {
    mls: String,
    price: String,
    pix: String,
}

impl Listing {
    fn new(mls: &str, price: &str, pix: &str) -> Self {
        Self {
            mls: mls.into(),
            price: price.into(),
            pix: pix.into(),
        }
    }
}

fn document(property_type: PropertyType, listings: &[Listing]) -> String {
    let tag = property_type.as_str();
    let body: String = listings
        .iter()
        .map(|l| {
            format!(
                "<{tag}><Listing>\
                 <MLS>{}</MLS><ListPrice>{}</ListPrice><PixUpdtedDt>{}</PixUpdtedDt>\
                 <Street>12</Street><StreetName>King</StreetName><Pool>Y</Pool>\
                 <TimestampSql>2024-03-01 10:00:00</TimestampSql>\
                 </Listing></{tag}>",
                l.mls, l.price, l.pix
            )
        })
        .collect();
    format!(r#"<RETS ReplyCode="0"><REData>{body}</REData></RETS>"#)
}

struct Harness {
    feed: FakeFeed,
    storage: Storage,
    service: SyncService,
    dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let feed = FakeFeed::default();
    let group = PropertyGroup::ResidentialAndCondo;
    let storage = Storage::in_memory(group.table_name()).await.unwrap();

    let service = SyncService::new(
        Arc::new(feed.clone()),
        Credentials::new("data", "pw"),
        Credentials::new("active", "pw"),
        DataLayout::new(dir.path()),
    )
    .with_storage(group, storage.clone());

    Harness {
        feed,
        storage,
        service,
        dir,
    }
}

async fn snapshot(storage: &Storage, root: &Path) -> Vec<Vec<Option<String>>> {
    let layout = DataLayout::new(root);
    let schema = SchemaDescriptor::load(&layout.schema_path(PropertyGroup::ResidentialAndCondo))
        .await
        .unwrap();
    let columns: Vec<&str> = schema.columns().collect();
    let sql = format!(
        "SELECT {} FROM {} ORDER BY \"MLS\"",
        columns
            .iter()
            .map(|c| format!("CAST({} AS TEXT)", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", "),
        quote_ident(schema.table_name())
    );
    sqlx::query(&sql)
        .fetch_all(storage.pool())
        .await
        .unwrap()
        .iter()
        .map(|row| {
            (0..columns.len())
                .map(|i| row.try_get::<Option<String>, _>(i).unwrap())
                .collect()
        })
        .collect()
}

async fn text_column(storage: &Storage, mls: &str, column: &str) -> Option<String> {
    let sql = format!(
        "SELECT CAST({} AS TEXT) FROM residential_and_condo_properties WHERE \"MLS\" = ?",
        quote_ident(column)
    );
    sqlx::query_scalar(&sql)
        .bind(mls)
        .fetch_one(storage.pool())
        .await
        .unwrap()
}

async fn row_count(storage: &Storage) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM residential_and_condo_properties")
        .fetch_one(storage.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn setup_loads_group_and_resync_is_idempotent() {
    let mut h = harness().await;
    h.feed.set_records(
        PropertyType::Residential,
        &[
            Listing::new("W1", "500000", "2024-02-01"),
            Listing::new("W2", "650000", "2024-02-01"),
        ],
    );
    h.feed
        .set_records(PropertyType::Condo, &[Listing::new("C1", "400000", "2024-02-01")]);

    let summaries = h
        .service
        .setup(PropertyGroup::ResidentialAndCondo, 24)
        .await
        .unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].1.created, 2);
    assert_eq!(summaries[1].1.created, 1);
    assert_eq!(row_count(&h.storage).await, 3);

    assert_eq!(
        text_column(&h.storage, "C1", "PropertyType").await.as_deref(),
        Some("CondoProperty")
    );
    assert_eq!(text_column(&h.storage, "W1", "Pool").await.as_deref(), Some("1"));
    assert_eq!(
        text_column(&h.storage, "W1", "PhotoLink").await.as_deref(),
        Some(r#"["W1-1.jpeg","W1-2.jpeg"]"#)
    );
    assert_eq!(
        text_column(&h.storage, "W1", "SearchAddress").await.as_deref(),
        // the schema has no StreetAbbreviation, Area or Province column
        Some("12 king    canada")
    );

    let photo = h
        .dir
        .path()
        .join("ResidentialAndCondos")
        .join("Photos")
        .join("W2-1.jpeg");
    assert_eq!(std::fs::read(photo).unwrap(), b"W2:1");

    let before = snapshot(&h.storage, h.dir.path()).await;
    let again = h
        .service
        .synchronize(PropertyType::Residential, 1)
        .await
        .unwrap();
    assert_eq!(again.updated_no_photos, 2);
    assert_eq!(again.created + again.updated_with_photos, 0);
    assert_eq!(snapshot(&h.storage, h.dir.path()).await, before);

    // unchanged photos are not requested again
    assert_eq!(h.feed.state.lock().unwrap().photo_batches.len(), 2);
}

#[tokio::test]
async fn price_history_follows_feed_changes() {
    let mut h = harness().await;
    h.feed
        .set_records(PropertyType::Residential, &[Listing::new("W1", "500000", "p1")]);
    h.service
        .setup(PropertyGroup::ResidentialAndCondo, 24)
        .await
        .unwrap();

    for (price, pix) in [("450000", "p1"), ("520000", "p2"), ("520000", "p2")] {
        h.feed
            .set_records(PropertyType::Residential, &[Listing::new("W1", price, pix)]);
        h.service
            .synchronize(PropertyType::Residential, 1)
            .await
            .unwrap();
    }

    assert_eq!(
        text_column(&h.storage, "W1", "MinListPrice").await.as_deref(),
        Some("450000")
    );
    assert_eq!(
        text_column(&h.storage, "W1", "MaxListPrice").await.as_deref(),
        Some("520000")
    );
    let tracker = PriceTracker::from_json(
        text_column(&h.storage, "W1", "PriceTracker").await.as_deref(),
    )
    .unwrap();
    let prices: Vec<&str> = tracker.entries().iter().map(|p| p.0.as_str()).collect();
    assert_eq!(prices, vec!["450000", "520000"]);
}

#[tokio::test]
async fn stale_listings_lose_rows_and_photos() {
    let mut h = harness().await;
    h.feed.set_records(
        PropertyType::Residential,
        &[
            Listing::new("A", "1", "p"),
            Listing::new("B", "1", "p"),
            Listing::new("C", "1", "p"),
        ],
    );
    h.feed
        .set_records(PropertyType::Condo, &[Listing::new("D", "1", "p")]);
    h.service
        .setup(PropertyGroup::ResidentialAndCondo, 24)
        .await
        .unwrap();

    h.feed.set_active(PropertyType::Residential, &["A", "C"]);
    let summaries = h
        .service
        .reconcile_stale_listings(&[PropertyType::Residential])
        .await
        .unwrap();

    let (_, summary) = &summaries[0];
    assert_eq!(summary.removed, vec!["B".to_string()]);
    assert_eq!(summary.files_removed, 2);
    assert_eq!(row_count(&h.storage).await, 3);

    let photos = h.dir.path().join("ResidentialAndCondos").join("Photos");
    assert!(!photos.join("B-1.jpeg").exists());
    assert!(photos.join("A-1.jpeg").exists());
    assert!(photos.join("D-2.jpeg").exists());
}

#[tokio::test]
async fn empty_active_response_deletes_nothing() {
    let mut h = harness().await;
    h.feed
        .set_records(PropertyType::Residential, &[Listing::new("A", "1", "p")]);
    h.service
        .setup(PropertyGroup::ResidentialAndCondo, 24)
        .await
        .unwrap();

    let summaries = h
        .service
        .reconcile_stale_listings(&[PropertyType::Residential])
        .await
        .unwrap();
    assert!(summaries[0].1.removed.is_empty());
    assert_eq!(row_count(&h.storage).await, 1);
}

#[tokio::test]
async fn failing_type_does_not_stop_the_run() {
    let mut h = harness().await;
    h.feed
        .set_records(PropertyType::Residential, &[Listing::new("A", "1", "p")]);
    h.service
        .setup(PropertyGroup::ResidentialAndCondo, 24)
        .await
        .unwrap();
    h.feed
        .set_records(PropertyType::Residential, &[Listing::new("A", "2", "p")]);

    // the commercial group was never set up, so it has no schema
    let err = h
        .service
        .run_updates(&[PropertyType::Commercial, PropertyType::Residential], 1)
        .await
        .unwrap_err();
    match err {
        SyncError::Incomplete { failed } => assert_eq!(failed, vec!["CommercialProperty"]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(text_column(&h.storage, "A", "ListPrice").await.as_deref(), Some("2"));
}

#[tokio::test]
async fn rejected_session_aborts_the_run() {
    let mut h = harness().await;
    h.service
        .setup(PropertyGroup::ResidentialAndCondo, 24)
        .await
        .unwrap();
    {
        let mut state = h.feed.state.lock().unwrap();
        state.reject_sessions = true;
        state.search_calls.clear();
    }

    let err = h
        .service
        .run_updates(&[PropertyType::Residential, PropertyType::Condo], 1)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(
        h.feed.state.lock().unwrap().search_calls,
        vec![PropertyType::Residential]
    );
}

async fn setup_with_rows(h: &mut Harness, keys: &[&str]) {
    let listings: Vec<Listing> = keys.iter().map(|k| Listing::new(k, "1", "p")).collect();
    h.feed.set_records(PropertyType::Residential, &listings);
    h.service
        .setup(PropertyGroup::ResidentialAndCondo, 24)
        .await
        .unwrap();
}

#[tokio::test]
async fn error_reply_for_active_listings_keeps_rows() {
    let mut h = harness().await;
    setup_with_rows(&mut h, &["A", "B"]).await;
    h.feed.state.lock().unwrap().active_reply_error = Some("20203".into());

    let err = h
        .service
        .reconcile_stale_listings(&[PropertyType::Residential])
        .await
        .unwrap_err();
    match err {
        SyncError::Incomplete { failed } => assert_eq!(failed, vec!["ResidentialProperty"]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(row_count(&h.storage).await, 2);

    let photos = h.dir.path().join("ResidentialAndCondos").join("Photos");
    assert!(photos.join("A-1.jpeg").exists());
    assert!(photos.join("B-1.jpeg").exists());
}

#[tokio::test]
async fn active_response_without_listings_keeps_rows() {
    let mut h = harness().await;
    setup_with_rows(&mut h, &["A", "B"]).await;
    h.feed.state.lock().unwrap().active.insert(
        PropertyType::Residential,
        r#"<RETS ReplyCode="0" ReplyText="Operation Successful"><REData></REData></RETS>"#.into(),
    );

    let summaries = h
        .service
        .reconcile_stale_listings(&[PropertyType::Residential])
        .await
        .unwrap();
    assert!(summaries[0].1.removed.is_empty());
    assert_eq!(row_count(&h.storage).await, 2);
}

#[tokio::test]
async fn records_before_malformed_xml_are_written() {
    let mut h = harness().await;
    setup_with_rows(&mut h, &[]).await;
    h.feed.set_raw_records(
        PropertyType::Residential,
        r#"<RETS ReplyCode="0"><REData>
            <ResidentialProperty><Listing>
              <MLS>OK1</MLS><ListPrice>500000</ListPrice><PixUpdtedDt>p</PixUpdtedDt>
            </Listing></ResidentialProperty>
            <ResidentialProperty><Listing><MLS>BAD</Pool></Listing></ResidentialProperty>
        </REData></RETS>"#,
    );

    let err = h
        .service
        .run_updates(&[PropertyType::Residential], 1)
        .await
        .unwrap_err();
    match err {
        SyncError::Incomplete { failed } => assert_eq!(failed, vec!["ResidentialProperty"]),
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(row_count(&h.storage).await, 1);
    assert_eq!(
        text_column(&h.storage, "OK1", "ListPrice").await.as_deref(),
        Some("500000")
    );

    // synchronize reports the fault after writing what came before it
    let direct = h.service.synchronize(PropertyType::Residential, 1).await;
    assert!(matches!(direct, Err(SyncError::Parse { .. })));
}
