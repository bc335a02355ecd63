//! Breadcrumb records and lookups across legacy field spellings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field added to every record with the time it was fetched.
pub const FETCHED_AT_KEY: &str = "FETCHED_AT";

/// Field added by the multi-vehicle publisher with the requested vehicle id.
pub const VEHICLE_TAG_KEY: &str = "__vehicle_id";

/// Spellings of the vehicle id seen on the topic, in priority order.
pub const VEHICLE_ID_KEYS: &[&str] = &["vehicle_id", "VehicleID", "VEHICLE_ID"];

/// Fields consulted by the day filter, in priority order.
pub const DAY_FILTER_KEYS: &[&str] = &[
    "time",
    "Time",
    "timestamp",
    "event_time",
    "utc_time",
    "vehicle_time",
];

/// One GPS/odometer sample as returned by the breadcrumb API.
///
/// The source schema is open-ended, so the record keeps every field it was
/// given. Enrichment only ever adds keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreadcrumbRecord(Map<String, Value>);

/// Records for one vehicle, in the order the endpoint returned them.
pub type VehicleBatch = Vec<BreadcrumbRecord>;

impl BreadcrumbRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns a copy of this record with `key` added, unless the record
    /// already carries that key.
    pub fn with_field(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut fields = self.0.clone();
        fields.entry(key.to_string()).or_insert_with(|| value.into());
        Self(fields)
    }

    /// Returns the first of `keys` holding a usable value.
    ///
    /// Nulls and empty strings count as absent, matching how the topic's
    /// producers have historically left unset ids.
    pub fn first_present(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .filter_map(|key| self.0.get(*key))
            .find(|value| !is_blank(value))
    }
}

impl From<Map<String, Value>> for BreadcrumbRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Renders a scalar the way it reads in the source payload: strings without
/// quotes, everything else as JSON text.
pub fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
