//! Wall-clock timestamps that cannot jump.
//!
//! A [`ClockAnchor`] pairs one wall-clock reading with one monotonic
//! reading.  Every later timestamp is derived from the monotonic clock, so
//! NTP steps or manual clock changes during a session do not distort the
//! series.

use std::time::Instant;

use chrono::{DateTime, Utc};

/// Optional external time reference used when anchoring a session.
pub trait TimeSync: Send + Sync {
    /// Current reference time, or `None` when the source is unavailable.
    fn reference_now(&self) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockAnchor {
    wall: DateTime<Utc>,
    monotonic: Instant,
}

impl ClockAnchor {
    /// Anchor the local wall clock to the current instant.
    pub fn now() -> Self {
        Self::with_reference(Utc::now())
    }

    /// Anchor `wall` to the current instant.
    pub fn with_reference(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            monotonic: Instant::now(),
        }
    }

    /// Anchor from `sync` when it answers, the local clock otherwise.
    pub fn from_sync(sync: Option<&dyn TimeSync>) -> Self {
        match sync.and_then(|s| s.reference_now()) {
            Some(reference) => Self::with_reference(reference),
            None => Self::now(),
        }
    }

    pub fn wall(&self) -> DateTime<Utc> {
        self.wall
    }

    /// Corrected wall-clock time of `instant`.  Instants before the anchor
    /// map to the anchor itself.
    pub fn at(&self, instant: Instant) -> DateTime<Utc> {
        let elapsed = instant.saturating_duration_since(self.monotonic);
        chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|d| self.wall.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// [`at`](Self::at) as fractional Unix milliseconds.
    pub fn timestamp_ms(&self, instant: Instant) -> f64 {
        let elapsed = instant.saturating_duration_since(self.monotonic);
        self.wall.timestamp_millis() as f64 + elapsed.as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Fixed(Option<DateTime<Utc>>);

    impl TimeSync for Fixed {
        fn reference_now(&self) -> Option<DateTime<Utc>> {
            self.0
        }
    }

    fn epoch_plus(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn timestamps_advance_with_monotonic_clock() {
        let anchor = ClockAnchor::with_reference(epoch_plus(1_000));
        let later = anchor.monotonic + Duration::from_millis(250);
        assert!((anchor.timestamp_ms(later) - 1_250.0).abs() < 1e-6);
        assert_eq!(anchor.at(later), epoch_plus(1_250));
    }

    #[test]
    fn instants_before_anchor_clamp() {
        let anchor = ClockAnchor::with_reference(epoch_plus(5_000));
        let earlier = anchor.monotonic - Duration::from_millis(10);
        assert_eq!(anchor.timestamp_ms(earlier), 5_000.0);
    }

    #[test]
    fn sync_reference_is_preferred() {
        let reference = epoch_plus(42_000);
        let anchor = ClockAnchor::from_sync(Some(&Fixed(Some(reference))));
        assert_eq!(anchor.wall(), reference);
    }

    #[test]
    fn unavailable_sync_falls_back_to_local_clock() {
        let before = Utc::now();
        let anchor = ClockAnchor::from_sync(Some(&Fixed(None)));
        assert!(anchor.wall() >= before);
        assert!(ClockAnchor::from_sync(None).wall() >= before);
    }
}
