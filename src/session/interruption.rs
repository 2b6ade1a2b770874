//! Barge-in handling

use super::scheduler::PlaybackScheduler;
use crate::audio::OutputDevice;

/// Discards stale narration when the service interrupts itself
#[derive(Debug, Default)]
pub struct InterruptionHandler {
    interruptions: u64,
}

impl InterruptionHandler {
    /// Create a handler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop all queued playback and restart the timeline at the device's
    /// current time
    ///
    /// Returns how many units were cut off.
    pub fn flush(&mut self, scheduler: &mut PlaybackScheduler, device: &mut dyn OutputDevice) -> usize {
        let stopped = scheduler.reset(device);
        self.interruptions += 1;

        tracing::debug!(
            stopped,
            resumed_at = scheduler.next_start_time(),
            interruptions = self.interruptions,
            "narration interrupted, playback flushed"
        );

        stopped
    }

    /// Interruptions handled so far in this session
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.interruptions
    }
}
