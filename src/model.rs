use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A bookmark as fetched from the remote collection for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: i64,
    pub link: String,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub last_modified: DateTime<Utc>,
    pub important: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub link: String,
    pub last_synced_update: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn from_bookmark(bookmark: &Bookmark) -> Self {
        LedgerEntry {
            id: bookmark.id,
            link: bookmark.link.clone(),
            last_synced_update: bookmark.last_modified,
        }
    }
}

/// Watermark reported by an empty ledger.
pub const BEGINNING_OF_TIME: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// Fixed-width UTC rendering used for storage, so that text ordering matches
/// chronological ordering.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_normalizes_offsets() {
        let zulu = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let millis = parse_timestamp("2024-01-01T00:00:00.000Z").unwrap();
        let offset = parse_timestamp("2024-01-01T02:00:00+02:00").unwrap();
        assert_eq!(zulu, millis);
        assert_eq!(zulu, offset);
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_format_timestamp_orders_like_time() {
        // "0.5" sorts after "0.123..." as text only once both are padded.
        let fine = parse_timestamp("2024-01-01T00:00:00.123456789Z").unwrap();
        let coarse = parse_timestamp("2024-01-01T00:00:00.5Z").unwrap();
        let whole = parse_timestamp("2024-01-01T00:00:01Z").unwrap();

        let (a, b, c) = (format_timestamp(&fine), format_timestamp(&coarse), format_timestamp(&whole));
        assert_eq!(a, "2024-01-01T00:00:00.123456789Z");
        assert_eq!(b, "2024-01-01T00:00:00.500000000Z");
        assert!(a < b);
        assert!(b < c);
        assert_eq!(parse_timestamp(&b), Some(coarse));
    }

    #[test]
    fn test_beginning_of_time_is_epoch() {
        assert_eq!(format_timestamp(&BEGINNING_OF_TIME), "1970-01-01T00:00:00.000000000Z");
    }
}
