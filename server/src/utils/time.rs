//! Time utility functions

/// Truncate nanoseconds since Unix epoch to whole seconds
pub fn nanos_to_secs(nanos: u64) -> i64 {
    (nanos / 1_000_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nanos_to_secs_truncates() {
        assert_eq!(nanos_to_secs(999_999_999), 0);
        assert_eq!(nanos_to_secs(1_000_000_000), 1);
    }

    #[test]
    fn test_nanos_to_secs_known_value() {
        // 2024-01-01 00:00:00 UTC = 1704067200 seconds
        assert_eq!(nanos_to_secs(1704067200_u64 * 1_000_000_000), 1704067200);
    }
}
