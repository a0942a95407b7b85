//! Trailing-edge debounce window for snapshot persistence.
//!
//! The first value offered in a quiet period opens a window that closes one
//! interval later. Values offered while the window is open only replace the
//! pending value. When the window closes the latest value is handed out
//! once, so a room writes at most one snapshot per interval and that
//! snapshot is always the newest state seen.
//!
//! The debouncer never reads the clock itself; callers pass `now`.

use std::time::Duration;

use tokio::time::Instant;

/// Result of [`Debouncer::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// A new window was opened; a flush is due at the given instant.
    Scheduled(Instant),
    /// The window was already open; the pending value was replaced.
    Coalesced,
}

#[derive(Debug)]
pub struct Debouncer<T> {
    interval: Duration,
    deadline: Option<Instant>,
    pending: Option<T>,
}

impl<T> Debouncer<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            pending: None,
        }
    }

    pub fn offer(&mut self, now: Instant, value: T) -> Offer {
        self.pending = Some(value);
        if self.deadline.is_some() {
            return Offer::Coalesced;
        }
        // Writes happen only at window close, so consecutive writes are at
        // least one interval apart.
        let deadline = now + self.interval;
        self.deadline = Some(deadline);
        Offer::Scheduled(deadline)
    }

    /// Takes the pending value if the window has closed by `now`.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.close(),
            _ => None,
        }
    }

    /// Takes the pending value regardless of the window. Used when the room
    /// goes away with unsaved state.
    pub fn take_pending(&mut self) -> Option<T> {
        self.close()
    }

    fn close(&mut self) -> Option<T> {
        self.deadline = None;
        self.pending.take()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIVE_SECS: Duration = Duration::from_secs(5);

    #[test]
    fn test_burst_yields_one_write_with_last_value() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(FIVE_SECS);

        assert_eq!(debouncer.offer(start, 1), Offer::Scheduled(start + FIVE_SECS));
        for (i, value) in (2..=50).enumerate() {
            let at = start + Duration::from_millis(10 * (i as u64 + 1));
            assert_eq!(debouncer.offer(at, value), Offer::Coalesced);
        }

        assert_eq!(debouncer.take_due(start + Duration::from_secs(4)), None);
        assert_eq!(debouncer.take_due(start + FIVE_SECS), Some(50));
        assert_eq!(debouncer.take_due(start + Duration::from_secs(6)), None);
        assert_eq!(debouncer.take_pending(), None);
    }

    #[test]
    fn test_two_changes_one_second_apart() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(FIVE_SECS);

        debouncer.offer(t0, "first");
        debouncer.offer(t0 + Duration::from_secs(1), "second");

        assert_eq!(debouncer.take_due(t0 + Duration::from_secs(2)), None);
        assert_eq!(debouncer.take_due(t0 + FIVE_SECS), Some("second"));
    }

    #[test]
    fn test_quiet_gap_opens_fresh_window() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(FIVE_SECS);
        debouncer.offer(t0, 1);
        let written_at = t0 + FIVE_SECS;
        assert_eq!(debouncer.take_due(written_at), Some(1));

        // A quiet gap longer than the interval opens a fresh window.
        let later = written_at + Duration::from_secs(20);
        assert_eq!(debouncer.offer(later, 2), Offer::Scheduled(later + FIVE_SECS));
    }

    #[test]
    fn test_flush_on_dissolve_takes_pending() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(FIVE_SECS);
        debouncer.offer(t0, "draft");

        assert_eq!(debouncer.take_pending(), Some("draft"));
        assert_eq!(debouncer.deadline(), None);
        assert_eq!(debouncer.take_pending(), None);
    }
}
