//! Process-wide monotonic timebase
//!
//! Event timestamps must never regress, so the pipeline anchors wall time
//! once at startup and advances it with `Instant`. Initialized once, read-only
//! afterwards.

use crate::types::Ts;
use std::sync::OnceLock;
use std::time::Instant;

static GLOBAL: OnceLock<Timebase> = OnceLock::new();

/// Monotonic clock anchored to the wall clock at construction
#[derive(Debug)]
pub struct Timebase {
    wall_anchor_ns: i64,
    instant_anchor: Instant,
}

impl Timebase {
    /// Anchor a new timebase at the current wall time
    #[must_use]
    pub fn anchor() -> Self {
        Self {
            wall_anchor_ns: Ts::wall_now().as_nanos(),
            instant_anchor: Instant::now(),
        }
    }

    /// The process-wide timebase, anchored on first use
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(Self::anchor)
    }

    /// Current monotonic timestamp
    #[must_use]
    pub fn now(&self) -> Ts {
        let elapsed = i64::try_from(self.instant_anchor.elapsed().as_nanos()).unwrap_or(i64::MAX);
        Ts::from_nanos(self.wall_anchor_ns.saturating_add(elapsed))
    }

    /// Bucket index of `ts` for windows of `bucket_ns` nanoseconds
    ///
    /// Used to salt idempotency keys so a re-emitted intent in a later
    /// window is a new order, not a replay.
    #[must_use]
    pub fn epoch_bucket(ts: Ts, bucket_ns: i64) -> i64 {
        if bucket_ns <= 0 {
            return 0;
        }
        ts.as_nanos() / bucket_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_regresses() {
        let tb = Timebase::anchor();
        let mut last = tb.now();
        for _ in 0..1000 {
            let now = tb.now();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_epoch_bucket() {
        let bucket = 1_000_000_000; // 1s
        assert_eq!(Timebase::epoch_bucket(Ts::from_nanos(999_999_999), bucket), 0);
        assert_eq!(Timebase::epoch_bucket(Ts::from_nanos(1_000_000_000), bucket), 1);
        assert_eq!(Timebase::epoch_bucket(Ts::from_nanos(5_500_000_000), bucket), 5);
        assert_eq!(Timebase::epoch_bucket(Ts::from_nanos(123), 0), 0);
    }
}
