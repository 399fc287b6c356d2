//! Wall-clock timestamps.
//!
//! Access and creation times of stored objects and roots are plain `i64`
//! nanoseconds since the UNIX epoch. Zero is the "zero epoch": a record whose
//! access time is zero has never been accessed since it was created.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The zero epoch.
pub const ZERO_EPOCH: i64 = 0;

/// Current wall-clock time in UNIX nanoseconds.
///
/// Clocks set before 1970 read as the zero epoch; times past year 2262 are
/// clamped to `i64::MAX`.
pub fn now_nanos() -> i64 {
    let since = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(since.as_nanos()).unwrap_or(i64::MAX)
}

/// Convert UNIX nanoseconds back into a `SystemTime`.
pub fn to_system_time(nanos: i64) -> SystemTime {
    if nanos <= 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::from_nanos(nanos as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_2020() {
        // 2020-01-01T00:00:00Z in nanoseconds.
        assert!(now_nanos() > 1_577_836_800_000_000_000);
    }

    #[test]
    fn now_does_not_go_backwards_quickly() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn zero_epoch_maps_to_unix_epoch() {
        assert_eq!(to_system_time(ZERO_EPOCH), UNIX_EPOCH);
        assert_eq!(to_system_time(-5), UNIX_EPOCH);
    }

    #[test]
    fn system_time_roundtrip() {
        let nanos = 1_700_000_000_123_456_789;
        let st = to_system_time(nanos);
        let back = st.duration_since(UNIX_EPOCH).unwrap().as_nanos() as i64;
        assert_eq!(back, nanos);
    }
}
