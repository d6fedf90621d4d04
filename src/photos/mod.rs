use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::feed::{FeedClient, PhotoPayload, Session};

pub mod multipart;

/// Listings per photo request; the feed caps response size.
pub const PHOTO_BATCH_SIZE: usize = 10;

static SEQUENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

/// Photos available for each listing after a reconcile pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PhotoMap {
    files: HashMap<String, Vec<String>>,
    unavailable: HashSet<String>,
}

/// What the photo pass produced for one listing.
#[derive(Debug, PartialEq, Eq)]
pub enum PhotoStatus<'a> {
    /// Filenames sorted by sequence; empty when the feed had no images.
    Fetched(Vec<&'a str>),
    /// The listing's batch failed, its photo state must stay untouched.
    Unavailable,
}

impl PhotoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mls: impl Into<String>, file_name: impl Into<String>) {
        self.files
            .entry(mls.into())
            .or_default()
            .push(file_name.into());
    }

    pub fn mark_unavailable<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unavailable.extend(keys.into_iter().map(Into::into));
    }

    pub fn extend(&mut self, other: PhotoMap) {
        for (mls, names) in other.files {
            self.files.entry(mls).or_default().extend(names);
        }
        self.unavailable.extend(other.unavailable);
    }

    /// Filenames in discovery order.
    pub fn files(&self, mls: &str) -> &[String] {
        self.files.get(mls).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn status(&self, mls: &str) -> PhotoStatus<'_> {
        if self.unavailable.contains(mls) {
            return PhotoStatus::Unavailable;
        }
        PhotoStatus::Fetched(sort_photo_links(
            self.files(mls).iter().map(String::as_str),
        ))
    }

    pub fn listing_count(&self) -> usize {
        self.files.len()
    }

    pub fn unavailable_count(&self) -> usize {
        self.unavailable.len()
    }
}

fn sequence_of(file_name: &str) -> u64 {
    SEQUENCE
        .find_iter(file_name)
        .last()
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(u64::MAX)
}

/// Orders photo filenames by their trailing sequence number.
pub fn sort_photo_links<'a, I>(names: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut names: Vec<&str> = names.into_iter().collect();
    names.sort_by_key(|n| sequence_of(n));
    names
}

/// Downloads and stores photos for listings whose images changed.
pub struct PhotoReconciler<'a> {
    client: &'a dyn FeedClient,
    dir: PathBuf,
}

impl<'a> PhotoReconciler<'a> {
    pub fn new(client: &'a dyn FeedClient, dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fetches photos for `keys` one batch at a time.
    ///
    /// A batch whose response has no multipart boundary is logged and its
    /// listings marked unavailable; transport, auth and filesystem errors
    /// abort the pass.
    pub async fn fetch(&self, session: &mut Session, keys: &[String]) -> Result<PhotoMap> {
        let batches = keys.len().div_ceil(PHOTO_BATCH_SIZE);
        info!(
            listings = keys.len(),
            batches,
            dir = %self.dir.display(),
            "starting photo reconcile"
        );

        let mut photos = PhotoMap::new();
        let mut processed = 0usize;

        for batch in keys.chunks(PHOTO_BATCH_SIZE) {
            let payload = self.client.fetch_photo_batch(session, batch).await?;

            match self.persist(&payload).await {
                Ok(found) => photos.extend(found),
                Err(e @ SyncError::PhotoBoundary { .. }) => {
                    error!(keys = ?batch, error = %e, "skipping photo batch");
                    photos.mark_unavailable(batch.iter().cloned());
                }
                Err(e) => return Err(e),
            }

            processed += batch.len();
            debug!(processed, total = keys.len(), "photo batch done");
        }

        info!(
            listings = photos.listing_count(),
            unavailable = photos.unavailable_count(),
            "photo reconcile complete"
        );
        Ok(photos)
    }

    /// Decodes one multipart response and writes its images to disk.
    pub async fn persist(&self, payload: &PhotoPayload) -> Result<PhotoMap> {
        let boundary = payload
            .content_type
            .as_deref()
            .and_then(multipart::boundary)
            .ok_or_else(|| SyncError::PhotoBoundary {
                content_type: payload.content_type.clone(),
            })?;

        let parts = multipart::split_parts(&payload.body, boundary);
        debug!(parts = parts.len(), "split photo response");

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SyncError::filesystem(&self.dir, e))?;

        let mut photos = PhotoMap::new();
        for part in parts {
            let Some(image) = multipart::parse_image_part(part) else {
                continue;
            };
            if !is_safe_component(&image.content_id) || !is_safe_component(&image.object_id) {
                warn!(
                    content_id = %image.content_id,
                    object_id = %image.object_id,
                    "skipping photo with unusable identifiers"
                );
                continue;
            }

            let file_name = image.file_name();
            let path = self.dir.join(&file_name);
            write_file(&path, image.data).await?;
            debug!(file = %file_name, bytes = image.data.len(), "stored photo");

            photos.insert(image.content_id, file_name);
        }
        Ok(photos)
    }
}

fn is_safe_component(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && value != "."
        && value != ".."
}

async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| SyncError::filesystem(path, e))?;
    file.write_all(data)
        .await
        .map_err(|e| SyncError::filesystem(path, e))?;
    file.flush()
        .await
        .map_err(|e| SyncError::filesystem(path, e))
}
