use std::collections::HashSet;
use std::path::Path;

use regex::RegexBuilder;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// Keys stored locally that the feed no longer lists as active, sorted.
pub fn stale_keys(stored: &HashSet<String>, active: &HashSet<String>) -> Vec<String> {
    let mut keys: Vec<String> = stored.difference(active).cloned().collect();
    keys.sort();
    keys
}

/// Removes every `{mls}-{n}.jpeg` file in `dir`, returning how many went.
///
/// A missing directory counts as nothing to delete.
pub async fn delete_photo_files(dir: &Path, mls: &str) -> Result<usize> {
    let pattern = format!(r"^{}-(\d+)\.(jpeg)$", regex::escape(mls));
    let matcher = RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| SyncError::Schema(format!("photo pattern for {mls}: {e}")))?;

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "no photo directory");
            return Ok(0);
        }
        Err(e) => return Err(SyncError::filesystem(dir, e)),
    };

    let mut removed = 0usize;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SyncError::filesystem(dir, e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !matcher.is_match(name) {
            continue;
        }

        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(file = %path.display(), "photo vanished before delete");
            }
            Err(e) => return Err(SyncError::filesystem(path, e)),
        }
    }
    Ok(removed)
}
