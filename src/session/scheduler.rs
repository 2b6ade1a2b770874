//! Gapless playback scheduling
//!
//! Each decoded fragment starts exactly where the previous one ends, or at
//! the device's current time if the timeline has already drained.

use std::collections::BTreeMap;

use crate::Result;
use crate::audio::{AudioBuffer, OutputDevice, UnitId};

/// A unit placed on the output timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledUnit {
    /// Unit identifier
    pub id: UnitId,
    /// Start time in the device clock domain
    pub start_time: f64,
    /// Length in seconds
    pub duration: f64,
}

impl ScheduledUnit {
    /// Time at which the unit finishes
    #[must_use]
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Owns the timeline cursor and the set of in-flight units
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start_time: f64,
    active: BTreeMap<UnitId, ScheduledUnit>,
    next_id: u64,
}

impl PlaybackScheduler {
    /// Create an empty scheduler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `buffer` directly after everything already queued
    ///
    /// # Errors
    ///
    /// Returns error if the device refuses the unit; the timeline is left
    /// unchanged
    pub fn enqueue(
        &mut self,
        buffer: &AudioBuffer,
        device: &mut dyn OutputDevice,
    ) -> Result<ScheduledUnit> {
        let start_time = self.next_start_time.max(device.current_time());
        let id = UnitId(self.next_id);

        device.start(id, buffer, start_time)?;
        self.next_id += 1;

        let unit = ScheduledUnit {
            id,
            start_time,
            duration: buffer.duration,
        };
        self.active.insert(id, unit);
        self.next_start_time = unit.end_time();

        tracing::trace!(
            unit = %id,
            start_time,
            duration = buffer.duration,
            active = self.active.len(),
            "scheduled playback unit"
        );

        Ok(unit)
    }

    /// Forget a unit that finished playing
    ///
    /// Returns false if the unit was not active (e.g. already flushed).
    pub fn complete(&mut self, id: UnitId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Stop every active unit and restart the timeline at the current time
    ///
    /// Returns how many units were stopped.
    pub fn reset(&mut self, device: &mut dyn OutputDevice) -> usize {
        let stopped = self.active.len();
        for id in std::mem::take(&mut self.active).into_keys() {
            device.stop(id);
        }
        self.next_start_time = device.current_time();
        stopped
    }

    /// Earliest time the next unit may begin
    #[must_use]
    pub const fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Number of units scheduled but not yet finished
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Whether nothing is scheduled
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }
}
