use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::feed::{lookup_timestamp, Credentials, FeedClient, Session};
use crate::layout::DataLayout;
use crate::models::{PropertyGroup, PropertyRecord, PropertyType};
use crate::parser::{decode_all, parse_standard_names};
use crate::photos::{PhotoMap, PhotoReconciler, PhotoStatus};
use crate::schema::SchemaDescriptor;
use crate::stale::{delete_photo_files, stale_keys};
use crate::storage::Storage;
use crate::sync::{build_mutation, classify, undeclared_fields, Classified, Decision};

/// Counts from one synchronization of a property type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub fetched: usize,
    pub created: usize,
    pub updated_with_photos: usize,
    pub updated_no_photos: usize,
    pub photos_unavailable: usize,
    pub rows_written: u64,
}

/// Counts from one stale-listing pass of a property type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleSummary {
    pub active: usize,
    pub stored: usize,
    pub removed: Vec<String>,
    pub files_removed: usize,
}

/// Runs the feed-to-storage pipeline for every property type.
///
/// Holds one session for record retrieval and one for the active-listing
/// checks, plus a store and schema per property group, opened on first use.
pub struct SyncService {
    client: Arc<dyn FeedClient>,
    data_session: Session,
    active_session: Session,
    layout: DataLayout,
    database_url: Option<String>,
    stores: HashMap<PropertyGroup, Storage>,
    schemas: HashMap<PropertyGroup, SchemaDescriptor>,
    warned_fields: HashSet<String>,
}

impl SyncService {
    pub fn new(
        client: Arc<dyn FeedClient>,
        data_credentials: Credentials,
        active_credentials: Credentials,
        layout: DataLayout,
    ) -> Self {
        Self {
            client,
            data_session: Session::new(data_credentials),
            active_session: Session::new(active_credentials),
            layout,
            database_url: None,
            stores: HashMap::new(),
            schemas: HashMap::new(),
            warned_fields: HashSet::new(),
        }
    }

    /// Uses one database at `url` for every group instead of a file per group.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Uses an already opened store for `group`.
    pub fn with_storage(mut self, group: PropertyGroup, storage: Storage) -> Self {
        self.stores.insert(group, storage);
        self
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    async fn storage(&mut self, group: PropertyGroup) -> Result<Storage> {
        if let Some(storage) = self.stores.get(&group) {
            return Ok(storage.clone());
        }
        let storage = match &self.database_url {
            Some(url) => Storage::connect(url, group.table_name()).await?,
            None => Storage::open(&self.layout.database_path(group), group.table_name()).await?,
        };
        self.stores.insert(group, storage.clone());
        Ok(storage)
    }

    async fn schema(&mut self, group: PropertyGroup) -> Result<SchemaDescriptor> {
        if let Some(schema) = self.schemas.get(&group) {
            return Ok(schema.clone());
        }
        let schema = SchemaDescriptor::load(&self.layout.schema_path(group)).await?;
        self.schemas.insert(group, schema.clone());
        Ok(schema)
    }

    /// Builds the schema of `group` from feed metadata, creates its table and
    /// loads the last `window_hours` of listings for each member type.
    pub async fn setup(
        &mut self,
        group: PropertyGroup,
        window_hours: u32,
    ) -> Result<Vec<(PropertyType, SyncSummary)>> {
        info!(%group, window_hours, "setting up property group");

        let mut field_lists = Vec::new();
        for &property_type in group.member_types() {
            let xml = self
                .client
                .fetch_metadata(&mut self.data_session, property_type)
                .await?;
            let names = parse_standard_names(&xml)?;
            debug!(%property_type, fields = names.len(), "read feed metadata");
            field_lists.push(names);
        }

        let schema = SchemaDescriptor::merge(group, field_lists)?;
        schema.save(&self.layout.schema_path(group)).await?;

        let storage = self.storage(group).await?;
        storage.ensure_table(&schema).await?;
        self.schemas.insert(group, schema);

        self.run_updates(group.member_types(), window_hours).await
    }

    /// Pulls listings changed in the last `window_hours` and writes them.
    ///
    /// Nothing is written unless every decoded record could be classified,
    /// given photos and turned into a statement. A document cut short by
    /// malformed XML still has its earlier records written before the parse
    /// error is returned.
    pub async fn synchronize(
        &mut self,
        property_type: PropertyType,
        window_hours: u32,
    ) -> Result<SyncSummary> {
        let started = Instant::now();
        let group = property_type.group();
        let schema = self.schema(group).await?;
        let storage = self.storage(group).await?;

        let since = lookup_timestamp(Utc::now(), window_hours);
        let Some(xml) = self
            .client
            .fetch_records_since(&mut self.data_session, property_type, &since)
            .await?
        else {
            info!(%property_type, since, "no new data");
            return Ok(SyncSummary::default());
        };
        self.archive(property_type, &xml).await?;

        // records ahead of a malformed fragment are still written; the fault
        // is reported once they are
        let batch = decode_all(&xml, &schema.template(), property_type);
        let fault = batch.fault;
        let records = self.latest_by_mls(batch.records, property_type);
        self.warn_undeclared(records.values(), &schema);

        let mut summary = SyncSummary {
            fetched: records.len(),
            ..SyncSummary::default()
        };

        let mut classified: Vec<Classified> = Vec::with_capacity(records.len());
        for (mls, record) in records {
            let existing = storage.find_by_mls(&mls).await?;
            let item = classify(record, existing);
            match item.decision {
                Decision::Create => summary.created += 1,
                Decision::UpdateWithPhotos(_) => summary.updated_with_photos += 1,
                Decision::UpdateNoPhotos(_) => summary.updated_no_photos += 1,
            }
            classified.push(item);
        }

        let photo_keys: Vec<String> = classified
            .iter()
            .filter(|c| c.decision.needs_photos())
            .filter_map(Classified::mls)
            .collect();
        let photos = if photo_keys.is_empty() {
            PhotoMap::new()
        } else {
            PhotoReconciler::new(self.client.as_ref(), self.layout.photo_dir(group))
                .fetch(&mut self.data_session, &photo_keys)
                .await?
        };
        summary.photos_unavailable = photo_keys
            .iter()
            .filter(|k| photos.status(k) == PhotoStatus::Unavailable)
            .count();

        let clauses: Vec<_> = classified
            .into_iter()
            .map(|c| build_mutation(c, &photos, &schema))
            .collect();
        summary.rows_written = storage.apply(&clauses).await?;

        info!(
            %property_type,
            fetched = summary.fetched,
            created = summary.created,
            updated_with_photos = summary.updated_with_photos,
            updated_no_photos = summary.updated_no_photos,
            photos_unavailable = summary.photos_unavailable,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "synchronized property type"
        );

        match fault {
            Some(e) => {
                error!(
                    %property_type,
                    written = summary.fetched,
                    error = %e,
                    "feed document was cut short by malformed xml"
                );
                Err(e)
            }
            None => Ok(summary),
        }
    }

    /// Synchronizes each type in turn.
    ///
    /// A failing type is logged and skipped; an authentication failure stops
    /// the run at once. Skipped types are reported as [`SyncError::Incomplete`].
    pub async fn run_updates(
        &mut self,
        property_types: &[PropertyType],
        window_hours: u32,
    ) -> Result<Vec<(PropertyType, SyncSummary)>> {
        let mut summaries = Vec::new();
        let mut failed = Vec::new();

        for &property_type in property_types {
            info!(%property_type, "processing property type");
            match self.synchronize(property_type, window_hours).await {
                Ok(summary) => summaries.push((property_type, summary)),
                Err(e) if e.is_fatal() => {
                    error!(%property_type, error = %e, "aborting run");
                    return Err(e);
                }
                Err(e) => {
                    error!(%property_type, error = %e, "synchronization failed");
                    failed.push(property_type.to_string());
                }
            }
        }

        if failed.is_empty() {
            Ok(summaries)
        } else {
            Err(SyncError::Incomplete { failed })
        }
    }

    /// Deletes stored listings the feed no longer reports as active.
    pub async fn reconcile_stale_listings(
        &mut self,
        property_types: &[PropertyType],
    ) -> Result<Vec<(PropertyType, StaleSummary)>> {
        let mut summaries = Vec::new();
        let mut failed = Vec::new();

        for &property_type in property_types {
            match self.reconcile_type(property_type).await {
                Ok(summary) => summaries.push((property_type, summary)),
                Err(e) if e.is_fatal() => {
                    error!(%property_type, error = %e, "aborting stale-listing check");
                    return Err(e);
                }
                Err(e) => {
                    error!(%property_type, error = %e, "stale-listing check failed");
                    failed.push(property_type.to_string());
                }
            }
        }

        if failed.is_empty() {
            Ok(summaries)
        } else {
            Err(SyncError::Incomplete { failed })
        }
    }

    async fn reconcile_type(&mut self, property_type: PropertyType) -> Result<StaleSummary> {
        let group = property_type.group();
        let storage = self.storage(group).await?;

        let Some(xml) = self
            .client
            .fetch_active_listing_keys(&mut self.active_session, property_type)
            .await?
        else {
            // an empty active set would wipe the table
            warn!(%property_type, "feed returned no active listings, skipping deletion");
            return Ok(StaleSummary::default());
        };

        let active: HashSet<String> = decode_all(&xml, &PropertyRecord::new(), property_type)
            .into_complete()?
            .mls_index
            .into_iter()
            .collect();
        if active.is_empty() {
            warn!(%property_type, "active listing response held no keys, skipping deletion");
            return Ok(StaleSummary::default());
        }
        let stored = storage.mls_set_for_type(property_type).await?;
        let stale = stale_keys(&stored, &active);

        let mut summary = StaleSummary {
            active: active.len(),
            stored: stored.len(),
            ..StaleSummary::default()
        };
        if stale.is_empty() {
            info!(%property_type, stored = summary.stored, "no stale listings");
            return Ok(summary);
        }

        warn!(%property_type, count = stale.len(), "deleting stale listings");
        storage.delete_by_mls(&stale).await?;

        let dir = self.layout.photo_dir(group);
        for mls in &stale {
            summary.files_removed += delete_photo_files(&dir, mls).await?;
        }
        info!(
            %property_type,
            removed = stale.len(),
            files_removed = summary.files_removed,
            "stale listings removed"
        );
        summary.removed = stale;
        Ok(summary)
    }

    /// Logs both sessions out of the feed.
    pub async fn close(&mut self) -> Result<()> {
        let data = self.client.logout(&mut self.data_session).await;
        let active = self.client.logout(&mut self.active_session).await;
        data.and(active)
    }

    async fn archive(&self, property_type: PropertyType, xml: &str) -> Result<()> {
        let path = self.layout.feed_archive_path(property_type);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::filesystem(parent, e))?;
        }
        tokio::fs::write(&path, xml)
            .await
            .map_err(|e| SyncError::filesystem(&path, e))?;
        debug!(%property_type, path = %path.display(), bytes = xml.len(), "archived feed response");
        Ok(())
    }

    /// Keys records by MLS, the last occurrence of a repeated key winning.
    fn latest_by_mls(
        &self,
        records: Vec<PropertyRecord>,
        property_type: PropertyType,
    ) -> IndexMap<String, PropertyRecord> {
        let mut latest = IndexMap::with_capacity(records.len());
        for record in records {
            let Some(mls) = record.mls() else {
                warn!(%property_type, "dropping record without MLS");
                continue;
            };
            if latest.insert(mls.clone(), record).is_some() {
                debug!(%property_type, mls, "duplicate listing in feed response");
            }
        }
        latest
    }

    fn warn_undeclared<'a>(
        &mut self,
        records: impl Iterator<Item = &'a PropertyRecord>,
        schema: &SchemaDescriptor,
    ) {
        for record in records {
            for field in undeclared_fields(record, schema) {
                if self.warned_fields.insert(field.to_string()) {
                    warn!(field, table = schema.table_name(), "feed field has no column, ignoring");
                }
            }
        }
    }
}
