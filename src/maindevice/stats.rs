//! Master-wide statistics, flushed to the log at most once per second.

use crate::{ethernet::DeviceStats, fmt, pdu::queue::QueueCounters};
use std::time::{Duration, Instant};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Rate-limited reporter for frame-scoped error counters.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    last_flush: Option<Instant>,
    reported: QueueCounters,
}

impl Stats {
    /// Log counter deltas when the flush interval has elapsed.
    pub(crate) fn maybe_flush(
        &mut self,
        now: Instant,
        counters: QueueCounters,
        device: DeviceStats,
        link_up: bool,
    ) {
        let due = self
            .last_flush
            .is_none_or(|last| now.saturating_duration_since(last) >= FLUSH_INTERVAL);

        if !due {
            return;
        }

        self.last_flush = Some(now);

        let timeouts = counters.timeouts - self.reported.timeouts;
        let unmatched = counters.unmatched - self.reported.unmatched;
        let corrupted = counters.corrupted - self.reported.corrupted;

        if timeouts > 0 || unmatched > 0 || corrupted > 0 {
            fmt::warn!(
                "PDU errors in the last second: {} timeouts, {} unmatched, {} corrupted (link {}, lost frames {})",
                timeouts,
                unmatched,
                corrupted,
                if link_up { "up" } else { "DOWN" },
                device.loss(),
            );
        }

        self.reported = counters;
    }
}

/// Public snapshot of the MainDevice's health.
#[derive(Debug, Clone, Copy)]
pub struct MainDeviceStatus {
    /// SubDevices currently known from the last topology scan.
    pub subdevice_count: u16,
    /// Physical link state of the bound NIC.
    pub link_up: bool,
    /// Whether process data exchange is active.
    pub activated: bool,
    /// Frames sent since start.
    pub tx_frames: u64,
    /// Frames received since start.
    pub rx_frames: u64,
    /// PDUs that timed out since start.
    pub pdu_timeouts: u64,
    /// Unmatched PDUs since start.
    pub unmatched_pdus: u64,
    /// Malformed frames since start.
    pub corrupted_frames: u64,
}
