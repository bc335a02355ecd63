//! Record enrichment and the single-day filter.
//!
//! The day filter is a plain string-prefix test on a handful of timestamp
//! fields. It does not parse dates and does not account for time zones, and
//! callers rely on it behaving exactly that way.

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::record::{
    BreadcrumbRecord, DAY_FILTER_KEYS, FETCHED_AT_KEY, VEHICLE_TAG_KEY, VehicleBatch,
    value_as_text,
};

/// Formats the fetch time as RFC 3339 UTC with a `Z` suffix.
pub fn fetched_at_stamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Returns a copy of `record` carrying the fetch time and, when given, the
/// vehicle id it was requested under.
pub fn enrich(
    record: &BreadcrumbRecord,
    now: DateTime<Utc>,
    vehicle_id: Option<&str>,
) -> BreadcrumbRecord {
    let enriched = record.with_field(FETCHED_AT_KEY, fetched_at_stamp(now));
    match vehicle_id {
        Some(id) => enriched.with_field(VEHICLE_TAG_KEY, id),
        None => enriched,
    }
}

/// True when any day-filter field, read as text, starts with `date`.
pub fn matches_day(record: &BreadcrumbRecord, date: &str) -> bool {
    DAY_FILTER_KEYS
        .iter()
        .filter_map(|key| record.get(key))
        .any(|value| value_as_text(value).starts_with(date))
}

/// Result of running the day filter over one vehicle's batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DayFilterOutcome {
    pub records: VehicleBatch,
    /// Set when nothing matched and the whole raw batch was kept instead.
    pub fell_back: bool,
}

/// Keeps the records for `date`.
///
/// If a non-empty batch has no matching record at all, the batch is returned
/// whole rather than dropped.
pub fn filter_day(raw: VehicleBatch, date: &str) -> DayFilterOutcome {
    let matching: VehicleBatch = raw
        .iter()
        .filter(|record| matches_day(record, date))
        .cloned()
        .collect();

    if matching.is_empty() && !raw.is_empty() {
        DayFilterOutcome {
            records: raw,
            fell_back: true,
        }
    } else {
        DayFilterOutcome {
            records: matching,
            fell_back: false,
        }
    }
}

/// How fetched batches are prepared before they are snapshotted and published.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    pub target_date: Option<String>,
    pub tag_vehicle: bool,
}

impl Normalizer {
    /// Filters (when a target date is set) and then enriches one vehicle's batch.
    pub fn normalize_batch(
        &self,
        vehicle_id: &str,
        raw: VehicleBatch,
        now: DateTime<Utc>,
    ) -> VehicleBatch {
        let raw_len = raw.len();

        let kept = match &self.target_date {
            Some(date) => {
                let outcome = filter_day(raw, date);
                if outcome.fell_back {
                    warn!(
                        vehicle_id,
                        target_date = %date,
                        records = raw_len,
                        "No records matched target date, keeping unfiltered batch"
                    );
                } else {
                    debug!(vehicle_id, kept = outcome.records.len(), raw = raw_len, "Day filter applied");
                }
                outcome.records
            }
            None => raw,
        };

        let tag = self.tag_vehicle.then_some(vehicle_id);
        kept.iter().map(|record| enrich(record, now, tag)).collect()
    }
}
