use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::feed::{FeedClient, PhotoPayload, Session};
use crate::models::PropertyType;
use crate::parser::{reply_code, reply_text, NO_RECORDS_REPLY_CODE};

/// Reply code of a successful RETS transaction.
const SUCCESS_REPLY_CODE: &str = "0";

/// A RETS response that came back with HTTP 200 but an error reply code.
#[derive(Debug, thiserror::Error)]
#[error("feed replied {code}: {text}")]
pub struct ReplyError {
    pub code: String,
    pub text: String,
}

/// Sorts a response body by its reply code: success passes through, the
/// "no records" code becomes `None`, anything else is a transport failure.
fn check_reply(context: &str, xml: String) -> Result<Option<String>> {
    match reply_code(&xml) {
        None | Some(SUCCESS_REPLY_CODE) => Ok(Some(xml)),
        Some(NO_RECORDS_REPLY_CODE) => Ok(None),
        Some(code) => Err(SyncError::transport(
            context,
            ReplyError {
                code: code.to_string(),
                text: reply_text(&xml).unwrap_or_default().to_string(),
            },
        )),
    }
}

/// `name=value` pairs of every `Set-Cookie` header, attributes dropped.
fn session_cookies(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// A 401 means the server dropped the session; the run cannot go on with it.
fn reject_unauthorized(status: StatusCode, session: &mut Session, context: &str) -> Result<()> {
    if status != StatusCode::UNAUTHORIZED {
        return Ok(());
    }
    session.invalidate();
    Err(SyncError::FeedAuth {
        username: session.username().to_string(),
        reason: format!("{context} rejected the session"),
    })
}

/// `ID` parameter asking for every photo of each listing.
fn photo_object_ids(keys: &[String]) -> String {
    keys.iter()
        .map(|k| format!("{k}:*"))
        .collect::<Vec<_>>()
        .join(",")
}

/// URLs and client identification of a RETS server.
#[derive(Debug, Clone)]
pub struct RetsEndpoints {
    pub login_url: String,
    pub logout_url: String,
    pub search_url: String,
    pub metadata_url: String,
    pub object_url: String,
    pub rets_version: String,
    pub user_agent: String,
}

/// HTTP feed client speaking RETS 1.x.
pub struct RetsClient {
    client: Client,
    endpoints: RetsEndpoints,
}

impl RetsClient {
    pub fn new(endpoints: RetsEndpoints) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        let version = HeaderValue::from_str(&endpoints.rets_version)
            .map_err(|e| SyncError::transport("invalid RETS-Version header", e))?;
        headers.insert("RETS-Version", version);

        let client = Client::builder()
            .user_agent(endpoints.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| SyncError::transport("building http client", e))?;

        Ok(Self { client, endpoints })
    }

    async fn login(&self, session: &mut Session) -> Result<()> {
        let username = session.username().to_string();
        info!(%username, "logging in to feed");

        let auth_error = |reason: String| SyncError::FeedAuth {
            username: username.clone(),
            reason,
        };

        let res = self
            .client
            .get(&self.endpoints.login_url)
            .basic_auth(&username, Some(&session.credentials().password))
            .send()
            .await
            .map_err(|e| auth_error(e.to_string()))?;

        if res.status() != StatusCode::OK {
            return Err(auth_error(format!("login returned {}", res.status())));
        }

        let cookies = session_cookies(res.headers());

        if cookies.is_empty() {
            return Err(auth_error("login response carried no session cookies".into()));
        }

        session.establish(cookies, Utc::now());
        Ok(())
    }

    async fn ensure_session(&self, session: &mut Session) -> Result<()> {
        if session.is_live_at(Utc::now()) {
            debug!(username = session.username(), "reusing live feed session");
            return Ok(());
        }
        self.login(session).await
    }

    /// Sends an authenticated request and refreshes the session's idle window.
    async fn send(
        &self,
        session: &mut Session,
        context: &str,
        request: RequestBuilder,
    ) -> Result<Response> {
        self.ensure_session(session).await?;

        let request = match session.cookie_header() {
            Some(cookie) => request.header(COOKIE, cookie),
            None => request,
        };

        let res = request
            .send()
            .await
            .map_err(|e| SyncError::transport(context, e))?;

        reject_unauthorized(res.status(), session, context)?;

        let res = res
            .error_for_status()
            .map_err(|e| SyncError::transport(context, e))?;
        session.touch(Utc::now());
        Ok(res)
    }

    async fn search(
        &self,
        session: &mut Session,
        property_type: PropertyType,
        query: String,
    ) -> Result<Option<String>> {
        let context = format!("search {property_type}");
        let request = self.client.get(&self.endpoints.search_url).query(&[
            ("QueryType", "DMQL2"),
            ("Format", "STANDARD-XML"),
            ("Count", "1"),
            ("SearchType", "Property"),
            ("Class", property_type.as_str()),
            ("Query", query.as_str()),
        ]);

        let xml = self
            .send(session, &context, request)
            .await?
            .text()
            .await
            .map_err(|e| SyncError::transport(context.as_str(), e))?;

        let reply = check_reply(&context, xml)?;
        if reply.is_none() {
            info!(%property_type, "feed search matched no records");
        }
        Ok(reply)
    }
}

#[async_trait]
impl FeedClient for RetsClient {
    async fn fetch_metadata(
        &self,
        session: &mut Session,
        property_type: PropertyType,
    ) -> Result<String> {
        let context = format!("metadata {property_type}");
        let id = format!("Property:{property_type}");
        let request = self.client.get(&self.endpoints.metadata_url).query(&[
            ("Type", "METADATA-TABLE"),
            ("ID", id.as_str()),
            ("Format", "STANDARD-XML"),
        ]);

        let xml = self
            .send(session, &context, request)
            .await?
            .text()
            .await
            .map_err(|e| SyncError::transport(context.as_str(), e))?;

        check_reply(&context, xml)?.ok_or_else(|| {
            SyncError::transport(
                context.as_str(),
                ReplyError {
                    code: NO_RECORDS_REPLY_CODE.to_string(),
                    text: "no metadata for class".to_string(),
                },
            )
        })
    }

    async fn fetch_records_since(
        &self,
        session: &mut Session,
        property_type: PropertyType,
        since: &str,
    ) -> Result<Option<String>> {
        info!(%property_type, since, "fetching updated listings");
        self.search(session, property_type, format!("(Timestamp_sql={since}),(Status=|A)"))
            .await
    }

    async fn fetch_active_listing_keys(
        &self,
        session: &mut Session,
        property_type: PropertyType,
    ) -> Result<Option<String>> {
        info!(%property_type, "fetching active listing keys");
        self.search(session, property_type, "(Status=|A)".to_string())
            .await
    }

    async fn fetch_photo_batch(
        &self,
        session: &mut Session,
        keys: &[String],
    ) -> Result<PhotoPayload> {
        let ids = photo_object_ids(keys);
        let request = self.client.get(&self.endpoints.object_url).query(&[
            ("Type", "Photo"),
            ("Resource", "Property"),
            ("ID", ids.as_str()),
        ]);

        let res = self.send(session, "photo batch", request).await?;
        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = res
            .bytes()
            .await
            .map_err(|e| SyncError::transport("photo batch body", e))?;

        debug!(keys = keys.len(), bytes = body.len(), "received photo batch");
        Ok(PhotoPayload { content_type, body })
    }

    async fn logout(&self, session: &mut Session) -> Result<()> {
        let Some(cookie) = session.cookie_header() else {
            return Ok(());
        };

        let result = self
            .client
            .get(&self.endpoints.logout_url)
            .header(COOKIE, cookie)
            .send()
            .await;
        session.invalidate();

        match result {
            Ok(res) if res.status().is_success() => {
                info!(username = session.username(), "logged out of feed");
                Ok(())
            }
            Ok(res) => {
                warn!(status = %res.status(), "feed logout was not acknowledged");
                Ok(())
            }
            Err(e) => Err(SyncError::transport("logout", e)),
        }
    }
}
