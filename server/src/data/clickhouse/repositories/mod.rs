//! Batch-insert repositories for the three pipeline tables

pub mod alert;
pub mod cost;
pub mod span;

use time::OffsetDateTime;

/// Convert nanoseconds since epoch to an OffsetDateTime for DateTime64 columns
pub(crate) fn nanos_to_offset(nanos: u64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(nanos as i128)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Convert a chrono UTC timestamp to an OffsetDateTime
pub(crate) fn chrono_to_offset(dt: chrono::DateTime<chrono::Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(
        dt.timestamp_nanos_opt().unwrap_or_default() as i128
    )
    .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nanos_to_offset() {
        let dt = nanos_to_offset(1_500_000_000);
        assert_eq!(dt.unix_timestamp(), 1);
    }

    #[test]
    fn test_chrono_to_offset_roundtrip() {
        let now = chrono::Utc::now();
        let offset = chrono_to_offset(now);
        assert_eq!(offset.unix_timestamp(), now.timestamp());
    }
}
