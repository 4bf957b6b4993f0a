//! Crate-level configuration structs, in the shape the rest of this corpus
//! uses for its own worker/network configuration.

use serde::{Deserialize, Serialize};

/// Request queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a pending request waits for a correlated response before
    /// expiring. Default 60s per the dispatcher's documented default.
    pub request_timeout_ms: u64,
    /// Subscription `since` back-window, subtracted from the earliest
    /// relevant timestamp to tolerate clock skew and relay buffering.
    pub since_window_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 60_000,
            since_window_secs: 30,
        }
    }
}

/// Relay transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayTransportConfig {
    pub connect_timeout_ms: u64,
    pub send_queue_capacity: usize,
}

impl Default for RelayTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            send_queue_capacity: 50,
        }
    }
}
