// Per-context counters for traffic that was dropped or handled in place

use crate::error::RouteError;
use serde::Serialize;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub decode_errors: u64,
    pub direction_violations: u64,
    pub origin_mismatches: u64,
    pub hidden_channel_drops: u64,
    pub queue_overflows: u64,
    pub unroutable: u64,
    pub unmatched_responses: u64,
    pub reflections_ignored: u64,
    pub pings_answered: u64,
    pub ports_closed: u64,
    pub reconnects: u64,
    pub timeouts: u64,
    /// Gauges, filled in when a snapshot is taken
    pub pending_requests: usize,
    pub open_ports: usize,
}

impl BridgeStats {
    /// Count a routing failure and log it at the level it deserves.
    pub fn record(&mut self, error: &RouteError) {
        match error {
            RouteError::DirectionViolation { .. } => {
                self.direction_violations += 1;
                tracing::warn!(%error, "dropping envelope");
            }
            RouteError::OriginMismatch { .. } => {
                self.origin_mismatches += 1;
                tracing::warn!(%error, "dropping envelope");
            }
            RouteError::HiddenChannel(_) => {
                self.hidden_channel_drops += 1;
                tracing::warn!(%error, "dropping envelope");
            }
            RouteError::QueueOverflow { .. } => {
                self.queue_overflows += 1;
                tracing::warn!(%error, "dropping envelope");
            }
            RouteError::NoRoute { .. } => {
                self.unroutable += 1;
                tracing::debug!(%error, "dropping envelope");
            }
        }
    }

    /// Total envelopes discarded without reaching a handler or a caller.
    pub fn dropped(&self) -> u64 {
        self.decode_errors
            + self.direction_violations
            + self.origin_mismatches
            + self.hidden_channel_drops
            + self.queue_overflows
            + self.unroutable
            + self.unmatched_responses
    }
}
