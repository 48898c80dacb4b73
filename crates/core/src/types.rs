/// All primary keys are SQLite INTEGER rowids.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Convert stored epoch milliseconds into a [`Timestamp`].
///
/// Out-of-range values collapse to the Unix epoch rather than failing;
/// stored values are always produced by [`to_millis`].
pub fn from_millis(ms: i64) -> Timestamp {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Convert a [`Timestamp`] into epoch milliseconds for storage.
pub fn to_millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    to_millis(chrono::Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip_preserves_precision() {
        let ts = from_millis(1_700_000_123_456);
        assert_eq!(to_millis(ts), 1_700_000_123_456);
    }

    #[test]
    fn out_of_range_millis_fall_back_to_epoch() {
        assert_eq!(from_millis(i64::MAX).timestamp(), 0);
    }
}
