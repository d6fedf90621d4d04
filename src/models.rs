use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Column names every listing table carries regardless of feed metadata.
pub mod columns {
    pub const MLS: &str = "MLS";
    pub const PROPERTY_TYPE: &str = "PropertyType";
    pub const TIMESTAMP_SQL: &str = "TimestampSql";
    pub const PHOTO_LINK: &str = "PhotoLink";
    pub const PHOTO_COUNT: &str = "PhotoCount";
    pub const MIN_LIST_PRICE: &str = "MinListPrice";
    pub const MAX_LIST_PRICE: &str = "MaxListPrice";
    pub const PRICE_TRACKER: &str = "PriceTracker";
    pub const SEARCH_ADDRESS: &str = "SearchAddress";

    // Feed-discovered fields the engine reads.
    pub const LIST_PRICE: &str = "ListPrice";
    pub const PHOTO_UPDATED: &str = "PixUpdtedDt";

    pub const CORE: [&str; 9] = [
        MLS,
        PROPERTY_TYPE,
        TIMESTAMP_SQL,
        PHOTO_LINK,
        PHOTO_COUNT,
        MIN_LIST_PRICE,
        MAX_LIST_PRICE,
        PRICE_TRACKER,
        SEARCH_ADDRESS,
    ];
}

/// Feed classes the engine knows how to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyType {
    Residential,
    Condo,
    Commercial,
}

impl PropertyType {
    pub const ALL: [PropertyType; 3] = [Self::Residential, Self::Condo, Self::Commercial];

    /// Class name used by the feed, also the per-listing XML tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Residential => "ResidentialProperty",
            Self::Condo => "CondoProperty",
            Self::Commercial => "CommercialProperty",
        }
    }

    pub fn group(self) -> PropertyGroup {
        match self {
            Self::Residential | Self::Condo => PropertyGroup::ResidentialAndCondo,
            Self::Commercial => PropertyGroup::Commercial,
        }
    }

    /// Misspelled field names some feed variants emit, paired with the name
    /// the metadata declares.
    pub fn field_corrections(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Condo => &[
                ("BuildingAmenities1", "BuildingAmenties1"),
                ("BuildingAmenities2", "BuildingAmenties2"),
                ("BuildingAmenities3", "BuildingAmenties3"),
                ("BuildingAmenities4", "BuildingAmenties4"),
                ("BuildingAmenities5", "BuildingAmenties5"),
                ("BuildingAmenities6", "BuildingAmenties6"),
            ],
            Self::Residential | Self::Commercial => &[],
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| SyncError::UnknownPropertyType(s.to_string()))
    }
}

/// Property types merged into one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyGroup {
    ResidentialAndCondo,
    Commercial,
}

impl PropertyGroup {
    pub const ALL: [PropertyGroup; 2] = [Self::ResidentialAndCondo, Self::Commercial];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResidentialAndCondo => "ResidentialAndCondoProperty",
            Self::Commercial => "CommercialProperty",
        }
    }

    pub fn member_types(self) -> &'static [PropertyType] {
        match self {
            Self::ResidentialAndCondo => &[PropertyType::Residential, PropertyType::Condo],
            Self::Commercial => &[PropertyType::Commercial],
        }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            Self::ResidentialAndCondo => "residential_and_condo_properties",
            Self::Commercial => "commercial_properties",
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::ResidentialAndCondo => "ResidentialAndCondos",
            Self::Commercial => "Commercial",
        }
    }
}

impl fmt::Display for PropertyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyGroup {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| SyncError::UnknownPropertyType(s.to_string()))
    }
}

/// A single field value as decoded from the feed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Int(i64),
    Text(String),
}

impl FieldValue {
    /// Canonicalizes feed text: `null` is a real null and `Y`/`N` flags become 1/0.
    pub fn from_feed_text(text: &str) -> Self {
        match text {
            "null" => Self::Null,
            "Y" => Self::Int(1),
            "N" => Self::Int(0),
            other => Self::Text(other.to_string()),
        }
    }

    pub fn from_option(value: Option<String>) -> Self {
        value.map_or(Self::Null, Self::Text)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The value as a TEXT column stores it.
    pub fn as_sql_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Int(i) => Some(i.to_string()),
            Self::Text(s) => Some(s.clone()),
        }
    }
}

/// One listing, fields in schema order followed by any extra feed fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyRecord {
    fields: IndexMap<String, FieldValue>,
}

impl PropertyRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(FieldValue::as_sql_text)
    }

    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Moves `from` to `to`, replacing any value already held under `to`.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        match self.fields.shift_remove(from) {
            Some(value) => {
                self.fields.insert(to.to_string(), value);
                true
            }
            None => false,
        }
    }

    pub fn mls(&self) -> Option<String> {
        self.text(columns::MLS).filter(|m| !m.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, FieldValue)> for PropertyRecord {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// One `[price, timestamp]` entry in a listing's price history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint(pub String, pub Option<String>);

/// Append-only price history, stored as a JSON array of pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTracker(Vec<PricePoint>);

impl PriceTracker {
    pub fn from_json(raw: Option<&str>) -> serde_json::Result<Self> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(json) => serde_json::from_str(json),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn push(&mut self, price: String, timestamp: Option<String>) {
        self.0.push(PricePoint(price, timestamp));
    }

    pub fn entries(&self) -> &[PricePoint] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Snapshot of the stored row an incoming record is compared against.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoredListing {
    pub mls: String,
    pub photo_updated: Option<String>,
    pub list_price: Option<String>,
    pub min_list_price: Option<String>,
    pub max_list_price: Option<String>,
    pub price_tracker: PriceTracker,
}

/// A parameterized statement queued for transactional application.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationClause {
    pub sql: String,
    pub params: Vec<FieldValue>,
}

impl MutationClause {
    pub fn new(sql: impl Into<String>, params: Vec<FieldValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_text_is_canonicalized() {
        assert_eq!(FieldValue::from_feed_text("null"), FieldValue::Null);
        assert_eq!(FieldValue::from_feed_text("Y"), FieldValue::Int(1));
        assert_eq!(FieldValue::from_feed_text("N"), FieldValue::Int(0));
        assert_eq!(
            FieldValue::from_feed_text("Yes"),
            FieldValue::Text("Yes".into())
        );
        assert_eq!(FieldValue::Int(1).as_sql_text().as_deref(), Some("1"));
    }

    #[test]
    fn property_types_round_trip_through_names() {
        for t in PropertyType::ALL {
            assert_eq!(t.as_str().parse::<PropertyType>().unwrap(), t);
        }
        assert!("Farm".parse::<PropertyType>().is_err());
        assert_eq!(PropertyType::Condo.group(), PropertyGroup::ResidentialAndCondo);
        assert_eq!(
            PropertyType::Residential.group().table_name(),
            PropertyType::Condo.group().table_name()
        );
    }

    #[test]
    fn rename_moves_value() {
        let mut record = PropertyRecord::new();
        record.set("BuildingAmenities1", FieldValue::Text("Gym".into()));
        assert!(record.rename("BuildingAmenities1", "BuildingAmenties1"));
        assert!(record.get("BuildingAmenities1").is_none());
        assert_eq!(record.text("BuildingAmenties1").as_deref(), Some("Gym"));
        assert!(!record.rename("Missing", "Other"));
    }

    #[test]
    fn price_tracker_serializes_as_pairs() {
        let mut tracker = PriceTracker::default();
        tracker.push("500000".into(), Some("2024-03-01 10:00:00".into()));
        let json = tracker.to_json();
        assert_eq!(json, r#"[["500000","2024-03-01 10:00:00"]]"#);
        assert_eq!(PriceTracker::from_json(Some(&json)).unwrap(), tracker);
        assert!(PriceTracker::from_json(None).unwrap().is_empty());
    }
}
