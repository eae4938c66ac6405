//! # Repeat Intervals
//!
//! Calendar math for `[n, unit]` repeat intervals.
//!
//! ## Occurrence Model
//! ```text
//! anchor          anchor + 1×I       anchor + 2×I       anchor + 3×I
//!   │                  │                  │                  │
//!   ▼                  ▼                  ▼                  ▼
//!   ●──────────────────●──────────────────●──────────────────●────► time
//!   initial grant      renewal k=1        renewal k=2        renewal k=3
//!
//! Every occurrence is computed from the anchor (anchor + k×I), never from
//! the previous occurrence, so month clamping (Jan 31 → Feb 28) never drifts.
//! ```

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// Interval Types
// =============================================================================

/// Unit of a repeat interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum IntervalUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    /// Fixed length in milliseconds, `None` for calendar units.
    fn fixed_millis(self) -> Option<i64> {
        match self {
            IntervalUnit::Minute => Some(60_000),
            IntervalUnit::Hour => Some(3_600_000),
            IntervalUnit::Day => Some(86_400_000),
            IntervalUnit::Week => Some(7 * 86_400_000),
            IntervalUnit::Month | IntervalUnit::Year => None,
        }
    }
}

/// A repeat interval such as `[1, "week"]`.
///
/// Serializes as a two-element array, matching the config format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepeatInterval(pub u32, pub IntervalUnit);

impl RepeatInterval {
    pub fn new(count: u32, unit: IntervalUnit) -> Self {
        RepeatInterval(count, unit)
    }

    pub fn count(&self) -> u32 {
        self.0
    }

    pub fn unit(&self) -> IntervalUnit {
        self.1
    }

    /// Stable textual key, e.g. `[1,"week"]`. Used inside synthetic transaction ids.
    pub fn key(&self) -> String {
        let unit = match self.1 {
            IntervalUnit::Minute => "minute",
            IntervalUnit::Hour => "hour",
            IntervalUnit::Day => "day",
            IntervalUnit::Week => "week",
            IntervalUnit::Month => "month",
            IntervalUnit::Year => "year",
        };
        format!("[{},\"{}\"]", self.0, unit)
    }
}

// =============================================================================
// Interval Math
// =============================================================================

/// Returns `millis + times × interval`, or `None` when out of range.
///
/// Months and years use calendar arithmetic in UTC and clamp to the last day
/// of a shorter month.
pub fn add_interval(millis: i64, interval: RepeatInterval, times: u32) -> Option<i64> {
    let steps = interval.count().checked_mul(times)?;
    match interval.unit().fixed_millis() {
        Some(unit_ms) => unit_ms
            .checked_mul(i64::from(steps))
            .and_then(|delta| millis.checked_add(delta)),
        None => {
            let months = match interval.unit() {
                IntervalUnit::Year => steps.checked_mul(12)?,
                _ => steps,
            };
            let start = DateTime::<Utc>::from_timestamp_millis(millis)?;
            start
                .checked_add_months(Months::new(months))
                .map(|d| d.timestamp_millis())
        }
    }
}

/// Counts occurrences `anchor + k×interval <= end` for `k >= 1`.
pub fn intervals_elapsed(anchor: i64, end: i64, interval: RepeatInterval) -> u32 {
    if end <= anchor || interval.count() == 0 {
        return 0;
    }
    if let Some(unit_ms) = interval.unit().fixed_millis() {
        let step = unit_ms * i64::from(interval.count());
        let elapsed = (end - anchor) / step;
        return u32::try_from(elapsed).unwrap_or(u32::MAX);
    }

    let mut k: u32 = 0;
    while let Some(next) = add_interval(anchor, interval, k + 1) {
        if next > end {
            break;
        }
        k += 1;
    }
    k
}

// =============================================================================
// "never" | [n, unit]
// =============================================================================

/// Serde adapter for item repeat settings: `"never"`, absent or `[n, unit]`.
pub mod repeat_or_never {
    use super::RepeatInterval;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Interval(RepeatInterval),
        Keyword(String),
    }

    pub fn serialize<S: Serializer>(
        value: &Option<RepeatInterval>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(repeat) => repeat.serialize(serializer),
            None => serializer.serialize_str("never"),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<RepeatInterval>, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Interval(repeat)) => Ok(Some(repeat)),
            Some(Raw::Keyword(keyword)) if keyword == "never" => Ok(None),
            Some(Raw::Keyword(keyword)) => Err(serde::de::Error::custom(format!(
                "invalid repeat '{}', expected \"never\" or [n, unit]",
                keyword
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ms(y: i32, m: u32, d: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap().timestamp_millis()
    }

    #[test]
    fn test_add_fixed_units() {
        let week = RepeatInterval::new(1, IntervalUnit::Week);
        assert_eq!(add_interval(ms(2025, 1, 1), week, 4), Some(ms(2025, 1, 29)));

        let hours = RepeatInterval::new(6, IntervalUnit::Hour);
        assert_eq!(add_interval(0, hours, 2), Some(12 * 3_600_000));
    }

    #[test]
    fn test_add_months_clamps_from_anchor() {
        let month = RepeatInterval::new(1, IntervalUnit::Month);
        let anchor = ms(2025, 1, 31);
        assert_eq!(add_interval(anchor, month, 1), Some(ms(2025, 2, 28)));
        // Computed from the anchor, so March keeps the 31st
        assert_eq!(add_interval(anchor, month, 2), Some(ms(2025, 3, 31)));

        let year = RepeatInterval::new(1, IntervalUnit::Year);
        assert_eq!(add_interval(ms(2024, 2, 29), year, 1), Some(ms(2025, 2, 28)));
    }

    #[test]
    fn test_intervals_elapsed_inclusive_boundary() {
        let week = RepeatInterval::new(1, IntervalUnit::Week);
        let anchor = ms(2025, 1, 1);
        assert_eq!(intervals_elapsed(anchor, ms(2025, 1, 29), week), 4);
        assert_eq!(intervals_elapsed(anchor, ms(2025, 1, 29) - 1, week), 3);
        assert_eq!(intervals_elapsed(anchor, anchor, week), 0);
        assert_eq!(intervals_elapsed(anchor, anchor - 1, week), 0);
    }

    #[test]
    fn test_intervals_elapsed_months() {
        let month = RepeatInterval::new(1, IntervalUnit::Month);
        assert_eq!(intervals_elapsed(ms(2025, 1, 15), ms(2025, 6, 15), month), 5);
        assert_eq!(intervals_elapsed(ms(2025, 1, 15), ms(2025, 6, 14), month), 4);
    }

    #[test]
    fn test_repeat_key() {
        assert_eq!(RepeatInterval::new(1, IntervalUnit::Week).key(), "[1,\"week\"]");
        assert_eq!(
            serde_json::to_string(&RepeatInterval::new(2, IntervalUnit::Month)).unwrap(),
            "[2,\"month\"]"
        );
    }

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(default, with = "repeat_or_never")]
        repeat: Option<RepeatInterval>,
    }

    #[test]
    fn test_repeat_or_never_parsing() {
        let never: Holder = serde_json::from_str(r#"{"repeat":"never"}"#).unwrap();
        assert_eq!(never.repeat, None);

        let absent: Holder = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.repeat, None);

        let weekly: Holder = serde_json::from_str(r#"{"repeat":[1,"week"]}"#).unwrap();
        assert_eq!(weekly.repeat, Some(RepeatInterval::new(1, IntervalUnit::Week)));

        assert!(serde_json::from_str::<Holder>(r#"{"repeat":"sometimes"}"#).is_err());
        assert_eq!(serde_json::to_string(&never).unwrap(), r#"{"repeat":"never"}"#);
    }
}
