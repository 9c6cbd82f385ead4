use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use std::time::{Duration, Instant};
use tracing::info;

/// A simple wall-clock timer for logging elapsed time.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!("⏱  Starting: {}", label);
        Self {
            label,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!(
            "⏱  Finished: {} (took {:.2?})",
            self.label,
            self.start.elapsed()
        );
    }
}

/// Format a large integer with thousands separators.
pub fn fmt_number(n: i64) -> String {
    let s = n.abs().to_string();
    let mut result = String::new();
    for (i, ch) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(ch);
    }
    if n < 0 {
        result.push('-');
    }
    result.chars().rev().collect()
}

// ── Market time ───────────────────────────────────────────────────────────────

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

/// Current wall-clock time in US/Eastern, with its offset.
pub fn now_eastern() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&New_York).fixed_offset()
}

pub fn format_ts(ts: &DateTime<FixedOffset>) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parse a snapshot timestamp.
/// "2024-05-01T10:00:00-04:00" | "2024-05-01 10:00:00.123-04:00" | "2024-05-01 10:00:00" (Eastern)
pub fn parse_ts(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts);
    }
    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts);
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    New_York
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.fixed_offset())
}

/// Serde adapter for optional Eastern timestamps in CSV snapshots.
/// Unparseable values read as `None`.
pub mod ts_format {
    use super::{format_ts, parse_ts};
    use chrono::{DateTime, FixedOffset};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &Option<DateTime<FixedOffset>>, ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match ts {
            Some(ts) => ser.serialize_str(&format_ts(ts)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(de: D) -> Result<Option<DateTime<FixedOffset>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(de)?;
        Ok(raw.as_deref().and_then(parse_ts))
    }
}
