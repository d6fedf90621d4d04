use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Timelike, Utc};

use crate::error::Result;
use crate::models::PropertyType;

mod fetcher;
pub mod session;

pub use fetcher::{ReplyError, RetsClient, RetsEndpoints};
pub use session::{Credentials, Session};

/// Raw multipart response of a photo request.
#[derive(Debug, Clone)]
pub struct PhotoPayload {
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Authenticated access to the listing feed.
///
/// Every call takes the session it runs under; implementations log in when
/// the session is not live and refresh its idle window after each call.
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// `METADATA-TABLE` document describing the fields of a class.
    async fn fetch_metadata(
        &self,
        session: &mut Session,
        property_type: PropertyType,
    ) -> Result<String>;

    /// Active listings updated at or after `since`; `None` when nothing matched.
    async fn fetch_records_since(
        &self,
        session: &mut Session,
        property_type: PropertyType,
        since: &str,
    ) -> Result<Option<String>>;

    /// Every active listing of a class; `None` when nothing matched.
    async fn fetch_active_listing_keys(
        &self,
        session: &mut Session,
        property_type: PropertyType,
    ) -> Result<Option<String>>;

    /// All photos of the given listings in one multipart response.
    async fn fetch_photo_batch(&self, session: &mut Session, keys: &[String])
        -> Result<PhotoPayload>;

    async fn logout(&self, session: &mut Session) -> Result<()> {
        session.invalidate();
        Ok(())
    }
}

/// DMQL2 lower bound for a window of `window_hours` ending at the current hour.
///
/// The trailing `+` makes the query match timestamps at or after the bound.
pub fn lookup_timestamp(now: DateTime<Utc>, window_hours: u32) -> String {
    let hour = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let from = hour - Duration::hours(i64::from(window_hours));
    format!("{}+", from.format("%Y-%m-%dT%H:%M:%S"))
}
