//! Construction-time configuration for venues, FIX sessions and consumers.

use std::time::Duration;

use crate::transport::DEFAULT_CONNECT_TIMEOUT;

/// One venue/symbol feed: where to connect and what to subscribe to.
#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub host: String,
    pub port: u16,
    /// Market/symbol id as the venue spells it (e.g. "BTC-EUR", "EUR/USD").
    pub market: String,
    pub connect_timeout: Duration,
    /// Reconnect attempts before the obtainer gives up and stays down.
    pub max_reconnect_attempts: u32,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            host: "ws.bitvavo.com".to_string(),
            port: 443,
            market: "BTC-EUR".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_reconnect_attempts: 10,
        }
    }
}

/// FIX session identity and heartbeat.
#[derive(Debug, Clone)]
pub struct FixSessionConfig {
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub heartbeat_secs: u32,
}

impl Default for FixSessionConfig {
    fn default() -> Self {
        Self {
            sender_comp_id: "FIXSIM-CLIENT-MKD".to_string(),
            target_comp_id: "FIXSIM-SERVER-MKD".to_string(),
            heartbeat_secs: 30,
        }
    }
}

/// Snapshot publication policy for a consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Coalescing window for depth-only updates; top-of-book changes publish
    /// immediately.
    pub publish_period: Duration,
    /// Levels per side copied into each snapshot.
    pub publish_levels: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            publish_period: Duration::from_millis(20),
            publish_levels: 80,
        }
    }
}
