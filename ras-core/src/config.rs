//! Core configuration: pool sizing, deadlines, advertised capabilities.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::FEATURE_ABORT_OPERATION;
use crate::ranging;

/// Tunables shared by the record store and both transfer engines.
/// Every field has a default, so an empty TOML table is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Connections that may hold a responder (or requester) instance at once.
    pub max_connections: usize,
    /// Live records per connection before the oldest is overwritten.
    pub buffers_per_conn: usize,
    /// Total record slots. Zero means `max_connections * buffers_per_conn`.
    pub pool_size: usize,
    /// How long the responder waits for AckRecord after CompleteRecord.
    pub ack_timeout_ms: u64,
    /// Delay before retrying a segment whose send was refused by the transport.
    pub send_retry_ms: u64,
    /// Antenna paths the controller may report (1..=4).
    pub max_antenna_paths: u8,
    /// Reserve room for mode 3 steps.
    pub mode_3_supported: bool,
    /// Accept the AbortOperation command and advertise it.
    pub abort_supported: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 1,
            buffers_per_conn: 1,
            pool_size: 0,
            ack_timeout_ms: 5000,
            send_retry_ms: 10,
            max_antenna_paths: 4,
            mode_3_supported: false,
            abort_supported: false,
        }
    }
}

impl Config {
    pub fn pool_slots(&self) -> usize {
        if self.pool_size == 0 {
            self.max_connections.saturating_mul(self.buffers_per_conn)
        } else {
            self.pool_size
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn send_retry(&self) -> Duration {
        Duration::from_millis(self.send_retry_ms)
    }

    /// Upper bound on one record's byte stream, ranging header included.
    pub fn max_procedure_len(&self) -> usize {
        ranging::procedure_mem(self.max_antenna_paths.clamp(1, 4), self.mode_3_supported)
    }

    /// Value of the Features channel.
    pub fn feature_bits(&self) -> u32 {
        if self.abort_supported {
            FEATURE_ABORT_OPERATION
        } else {
            0
        }
    }
}
