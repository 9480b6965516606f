use serde::{Deserialize, Serialize};

/// Window within which a second power cycle counts as a double reset.
pub const DOUBLE_RESET_TIMEOUT_MS: u64 = 5_000;

/// Distinguishes an armed marker from uninitialized storage.
const MARKER_MAGIC: u32 = 0x5243_4d31;

/// The durable trace of a recent boot. Written every boot, read back on the
/// next one before being overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetMarker {
    pub magic: u32,
    #[serde(rename = "armedAtMs")]
    pub armed_at_ms: u64,
}

impl ResetMarker {
    fn armed(now_ms: u64) -> Self {
        Self {
            magic: MARKER_MAGIC,
            armed_at_ms: now_ms,
        }
    }

    fn is_armed(&self) -> bool {
        self.magic == MARKER_MAGIC
    }
}

/// Detects two power cycles within the timeout window. Constructed once per
/// boot from whatever marker the previous boot left behind; the caller
/// persists [`ResetCycleTracker::armed_marker`] right away and clears the
/// durable marker when [`ResetCycleTracker::tick`] signals the end of the
/// window.
#[derive(Debug)]
pub struct ResetCycleTracker {
    pending_report: bool,
    armed_at_ms: u64,
    timeout_ms: u64,
    window_open: bool,
}

impl ResetCycleTracker {
    pub fn new(previous: Option<ResetMarker>, now_ms: u64) -> Self {
        Self::with_timeout(previous, now_ms, DOUBLE_RESET_TIMEOUT_MS)
    }

    pub fn with_timeout(previous: Option<ResetMarker>, now_ms: u64, timeout_ms: u64) -> Self {
        // A marker armed "in the future" means the clock reference was lost;
        // never treat that as a double reset.
        let pending_report = previous.is_some_and(|marker| {
            marker.is_armed()
                && now_ms
                    .checked_sub(marker.armed_at_ms)
                    .is_some_and(|elapsed| elapsed <= timeout_ms)
        });

        Self {
            pending_report,
            armed_at_ms: now_ms,
            timeout_ms,
            window_open: true,
        }
    }

    /// The marker to persist for the current boot.
    pub fn armed_marker(&self) -> ResetMarker {
        ResetMarker::armed(self.armed_at_ms)
    }

    /// Reports a detected double reset exactly once.
    pub fn take_double_reset(&mut self) -> bool {
        core::mem::take(&mut self.pending_report)
    }

    /// Returns true exactly once, when the detection window has elapsed
    /// without another reboot; the caller must then clear the durable
    /// marker so the next boot counts as a fresh single reset.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        if self.window_open && now_ms.saturating_sub(self.armed_at_ms) >= self.timeout_ms {
            self.window_open = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_boot_with_no_marker_does_not_trigger() {
        let mut tracker = ResetCycleTracker::new(None, 1_000);
        assert!(!tracker.take_double_reset());
    }

    #[test]
    fn reboot_within_window_triggers_exactly_once() {
        let boot_one = ResetCycleTracker::new(None, 1_000);
        let marker = boot_one.armed_marker();

        let mut boot_two = ResetCycleTracker::new(Some(marker), 3_000);
        assert!(boot_two.take_double_reset());
        assert!(!boot_two.take_double_reset());
    }

    #[test]
    fn reboot_after_window_does_not_trigger() {
        let boot_one = ResetCycleTracker::new(None, 1_000);
        let marker = boot_one.armed_marker();

        let mut boot_two = ResetCycleTracker::new(Some(marker), 1_000 + DOUBLE_RESET_TIMEOUT_MS + 1);
        assert!(!boot_two.take_double_reset());
    }

    #[test]
    fn cleared_marker_resets_the_sequence() {
        let boot_one = ResetCycleTracker::new(None, 1_000);
        let marker = boot_one.armed_marker();

        let mut boot_two = ResetCycleTracker::new(Some(marker), 2_000);
        assert!(boot_two.take_double_reset());

        // The window elapses; the durable marker is cleared.
        assert!(boot_two.tick(2_000 + DOUBLE_RESET_TIMEOUT_MS));

        let mut boot_three = ResetCycleTracker::new(None, 9_000);
        assert!(!boot_three.take_double_reset());
    }

    #[test]
    fn garbage_marker_does_not_trigger() {
        let garbage = ResetMarker {
            magic: 0xffff_ffff,
            armed_at_ms: 500,
        };
        let mut tracker = ResetCycleTracker::new(Some(garbage), 1_000);
        assert!(!tracker.take_double_reset());
    }

    #[test]
    fn marker_from_the_future_does_not_trigger() {
        let boot_one = ResetCycleTracker::new(None, 10_000);
        let marker = boot_one.armed_marker();

        let mut boot_two = ResetCycleTracker::new(Some(marker), 4_000);
        assert!(!boot_two.take_double_reset());
    }

    #[test]
    fn tick_signals_the_window_end_exactly_once() {
        let mut tracker = ResetCycleTracker::new(None, 0);
        assert!(!tracker.tick(DOUBLE_RESET_TIMEOUT_MS - 1));
        assert!(tracker.tick(DOUBLE_RESET_TIMEOUT_MS));
        assert!(!tracker.tick(DOUBLE_RESET_TIMEOUT_MS + 1_000));
    }

    #[test]
    fn custom_timeout_is_honored() {
        let boot_one = ResetCycleTracker::with_timeout(None, 0, 1_000);
        let marker = boot_one.armed_marker();

        let mut within = ResetCycleTracker::with_timeout(Some(marker), 900, 1_000);
        assert!(within.take_double_reset());

        let mut beyond = ResetCycleTracker::with_timeout(Some(marker), 1_100, 1_000);
        assert!(!beyond.take_double_reset());
    }
}
