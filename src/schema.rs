use std::path::Path;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SyncError};
use crate::models::{columns, FieldValue, PropertyGroup, PropertyRecord};

/// Ordered list of the feed fields stored for one property group.
///
/// Built once by setup from the feed metadata and persisted as JSON; every
/// later run loads it to build record templates and SQL column lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub group: PropertyGroup,
    fields: IndexSet<String>,
}

impl SchemaDescriptor {
    /// Merges per-type field lists, keeping first-seen order and dropping
    /// names that collide with the core columns.
    pub fn merge<I>(group: PropertyGroup, field_lists: I) -> Result<Self>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let fields = field_lists
            .into_iter()
            .flatten()
            .filter(|f| !columns::CORE.contains(&f.as_str()))
            .collect();
        let schema = Self { group, fields };
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        for field in &self.fields {
            if !is_identifier(field) {
                return Err(SyncError::Schema(format!(
                    "field name {field:?} is not a valid column identifier"
                )));
            }
        }
        Ok(())
    }

    pub fn table_name(&self) -> &'static str {
        self.group.table_name()
    }

    /// Feed-discovered fields, without the core columns.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    /// Every column of the table, core columns first.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        columns::CORE.into_iter().chain(self.fields())
    }

    pub fn has_column(&self, name: &str) -> bool {
        columns::CORE.contains(&name) || self.fields.contains(name)
    }

    /// A record with every column present and null.
    pub fn template(&self) -> PropertyRecord {
        self.columns()
            .map(|c| (c.to_string(), FieldValue::Null))
            .collect()
    }

    pub fn create_table_sql(&self) -> String {
        let mut defs = vec![format!("{} TEXT PRIMARY KEY NOT NULL", quote_ident(columns::MLS))];
        for column in self.columns().skip(1) {
            let ty = if column == columns::PHOTO_COUNT {
                "INTEGER"
            } else {
                "TEXT"
            };
            defs.push(format!("{} {ty}", quote_ident(column)));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
            quote_ident(self.table_name()),
            defs.join(",\n  ")
        )
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SyncError::Schema(format!(
                    "no schema at {}, run setup for this group first",
                    path.display()
                ))
            } else {
                SyncError::filesystem(path, e)
            }
        })?;
        let schema: Self = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Schema(format!("{}: {e}", path.display())))?;
        schema.validate()?;
        Ok(schema)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::filesystem(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Schema(e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| SyncError::filesystem(path, e))?;

        info!(
            group = %self.group,
            fields = self.fields.len(),
            path = %path.display(),
            "saved schema descriptor"
        );
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quotes a column or table name already checked by [`SchemaDescriptor`].
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
