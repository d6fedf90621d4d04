use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::{debug, error, info};

use crate::error::{Result, SyncError};
use crate::models::{columns, FieldValue, MutationClause, PriceTracker, PropertyType, StoredListing};
use crate::schema::{quote_ident, SchemaDescriptor};

/// One listing table in a SQLite database.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    table: &'static str,
}

impl Storage {
    pub async fn open(path: &Path, table: &'static str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::filesystem(parent, e))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect_with(options, &path.display().to_string(), table).await
    }

    /// Opens a store from a `sqlite:` URL.
    pub async fn connect(url: &str, table: &'static str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| SyncError::storage(format!("parsing {url}"), e))?
            .create_if_missing(true);
        Self::connect_with(options, url, table).await
    }

    async fn connect_with(
        options: SqliteConnectOptions,
        location: &str,
        table: &'static str,
    ) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| SyncError::storage(format!("opening {location}"), e))?;

        info!(location, table, "opened listing store");
        Ok(Self { pool, table })
    }

    /// A private in-memory database; one connection keeps it alive.
    pub async fn in_memory(table: &'static str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| SyncError::storage("in-memory options", e))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| SyncError::storage("opening in-memory store", e))?;
        Ok(Self { pool, table })
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the table, adding any schema columns an older table lacks.
    pub async fn ensure_table(&self, schema: &SchemaDescriptor) -> Result<()> {
        sqlx::query(&schema.create_table_sql())
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::storage(format!("creating table {}", self.table), e))?;

        let existing: HashSet<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
                .bind(self.table)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| SyncError::storage("reading table columns", e))?
                .into_iter()
                .collect();

        for column in schema.columns().filter(|c| !existing.contains(*c)) {
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN {} TEXT",
                quote_ident(self.table),
                quote_ident(column)
            );
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| SyncError::storage(format!("adding column {column}"), e))?;
            info!(table = self.table, column, "added column");
        }
        Ok(())
    }

    pub async fn find_by_mls(&self, mls: &str) -> Result<Option<StoredListing>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?",
            quote_ident(self.table),
            quote_ident(columns::MLS)
        );
        let Some(row) = sqlx::query(&sql)
            .bind(mls)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::storage(format!("looking up {mls}"), e))?
        else {
            return Ok(None);
        };

        // a schema without the column reads as null; a value of the wrong
        // type is an error
        let text = |name: &str| -> Result<Option<String>> {
            match row.try_get::<Option<String>, _>(name) {
                Ok(value) => Ok(value),
                Err(sqlx::Error::ColumnNotFound(_)) => Ok(None),
                Err(e) => Err(SyncError::storage(format!("reading {name} of {mls}"), e)),
            }
        };

        let price_tracker = PriceTracker::from_json(text(columns::PRICE_TRACKER)?.as_deref())
            .map_err(|e| {
                SyncError::storage(
                    format!("decoding PriceTracker of {mls}"),
                    sqlx::Error::Decode(Box::new(e)),
                )
            })?;

        Ok(Some(StoredListing {
            mls: mls.to_string(),
            photo_updated: text(columns::PHOTO_UPDATED)?,
            list_price: text(columns::LIST_PRICE)?,
            min_list_price: text(columns::MIN_LIST_PRICE)?,
            max_list_price: text(columns::MAX_LIST_PRICE)?,
            price_tracker,
        }))
    }

    pub async fn mls_set_for_type(&self, property_type: PropertyType) -> Result<HashSet<String>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            quote_ident(columns::MLS),
            quote_ident(self.table),
            quote_ident(columns::PROPERTY_TYPE)
        );
        let keys: Vec<String> = sqlx::query_scalar(&sql)
            .bind(property_type.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::storage(format!("listing stored {property_type} keys"), e))?;
        Ok(keys.into_iter().collect())
    }

    /// Applies every clause in one transaction; any failure rolls back all of them.
    pub async fn apply(&self, clauses: &[MutationClause]) -> Result<u64> {
        if clauses.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::storage("beginning transaction", e))?;
        let mut affected = 0u64;

        for (index, clause) in clauses.iter().enumerate() {
            let result = bind_params(sqlx::query(&clause.sql), &clause.params)
                .execute(&mut *tx)
                .await;
            match result {
                Ok(done) => affected += done.rows_affected(),
                Err(e) => {
                    error!(
                        table = self.table,
                        clause = index + 1,
                        total = clauses.len(),
                        error = %e,
                        "statement failed, rolling back batch"
                    );
                    // rollback consumes the transaction, so the connection
                    // goes back to the pool exactly once
                    if let Err(rollback) = tx.rollback().await {
                        error!(error = %rollback, "rollback failed");
                    }
                    return Err(SyncError::storage(
                        format!("statement {} of {} on {}", index + 1, clauses.len(), self.table),
                        e,
                    ));
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::storage("committing transaction", e))?;

        debug!(
            table = self.table,
            statements = clauses.len(),
            affected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "committed batch"
        );
        Ok(affected)
    }

    /// Deletes the given listings in one transaction.
    pub async fn delete_by_mls(&self, keys: &[String]) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(self.table),
            quote_ident(columns::MLS)
        );
        let clauses: Vec<MutationClause> = keys
            .iter()
            .map(|k| MutationClause::new(sql.clone(), vec![FieldValue::Text(k.clone())]))
            .collect();
        self.apply(&clauses).await
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [FieldValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            FieldValue::Null => query.bind(None::<String>),
            FieldValue::Int(i) => query.bind(*i),
            FieldValue::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}
