// ABOUTME: Canonical timestamped file names for dump artifacts
// ABOUTME: Formats run start times into sortable names and parses them back for retention

use chrono::{NaiveDateTime, Timelike};

/// Extension of every dump artifact (pg_dump tar format).
pub const ARTIFACT_EXTENSION: &str = "tar";

/// Layout of the timestamp part. Underscores stand in for colons so the
/// name is valid on every filesystem the artifacts may be copied to.
pub const TIMESTAMP_LAYOUT: &str = "%Y-%m-%d %H_%M_%S";

/// File name for an artifact created at `now`. Sub-second precision is dropped.
pub fn new_name(now: NaiveDateTime) -> String {
    format!("{}.{}", now.format(TIMESTAMP_LAYOUT), ARTIFACT_EXTENSION)
}

/// Recover the creation time from an artifact file name.
///
/// Returns `None` for anything that is not exactly a canonical artifact
/// name: wrong extension, a timestamp that does not parse, or one that
/// parses but is not written in canonical form (e.g. missing zero padding).
pub fn parse_name(file_name: &str) -> Option<NaiveDateTime> {
    let stem = file_name.strip_suffix(ARTIFACT_EXTENSION)?.strip_suffix('.')?;
    let parsed = NaiveDateTime::parse_from_str(stem, TIMESTAMP_LAYOUT).ok()?;

    if parsed.format(TIMESTAMP_LAYOUT).to_string() != stem {
        return None;
    }
    Some(parsed)
}

/// Truncate to whole seconds, the precision artifact names carry.
pub fn truncate_to_seconds(t: NaiveDateTime) -> NaiveDateTime {
    t.with_nanosecond(0).unwrap_or(t)
}
