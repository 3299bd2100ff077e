use lazy_static::lazy_static;
use std::time::{Instant, SystemTime};

lazy_static! {
    static ref PROCESS_START: Instant = Instant::now();
}

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock before unix epoch")
        .as_secs()
}

/// Microseconds elapsed since process start. Monotonic, immune to wall-clock
/// adjustments, suitable for ordering sensor samples.
#[inline]
pub fn monotonic_micros() -> u64 {
    PROCESS_START.elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_micros_is_monotonic() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(b >= a);
    }

    #[test]
    fn test_timestamp_secs_sane() {
        // 2020-01-01 as a lower bound
        assert!(timestamp_secs() > 1_577_836_800);
    }
}
