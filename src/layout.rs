use std::path::{Path, PathBuf};

use crate::models::{PropertyGroup, PropertyType};

/// On-disk locations under the data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn group_dir(&self, group: PropertyGroup) -> PathBuf {
        self.root.join(group.dir_name())
    }

    pub fn photo_dir(&self, group: PropertyGroup) -> PathBuf {
        self.group_dir(group).join("Photos")
    }

    pub fn schema_path(&self, group: PropertyGroup) -> PathBuf {
        self.group_dir(group).join("schema.json")
    }

    pub fn database_path(&self, group: PropertyGroup) -> PathBuf {
        self.group_dir(group).join("listings.db")
    }

    /// Where the last raw search response of a type is kept.
    pub fn feed_archive_path(&self, property_type: PropertyType) -> PathBuf {
        self.group_dir(property_type.group())
            .join(format!("{property_type}.xml"))
    }
}
