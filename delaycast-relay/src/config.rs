//! Relay configuration

use crate::types::IdentityScheme;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upper bound accepted by `set_delay` (milliseconds)
    pub max_delay_ms: u64,
    /// Interval between silence frames while idle (milliseconds)
    pub audio_idle_interval_ms: u64,
    /// Interval between repeated video frames while idle (milliseconds)
    pub video_idle_interval_ms: u64,
    /// How often a relay checks whether live media has stalled (milliseconds)
    pub idle_poll_interval_ms: u64,
    /// Time without a live emission after which idle keep-alive starts (milliseconds)
    pub stall_threshold_ms: u64,
    /// Lifetime of the access token minted for each relay session (seconds)
    pub credential_ttl_secs: u64,
    /// Interval of the registry sweep removing relays whose session died (seconds)
    pub maintenance_interval_secs: u64,
    /// Identity naming convention
    pub identity: IdentityScheme,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_delay_ms: 10_000,
            audio_idle_interval_ms: 20,
            video_idle_interval_ms: 250,
            idle_poll_interval_ms: 500,
            stall_threshold_ms: 1_000,
            credential_ttl_secs: 600,
            maintenance_interval_secs: 60,
            identity: IdentityScheme::default(),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn audio_idle_interval(&self) -> Duration {
        Duration::from_millis(self.audio_idle_interval_ms)
    }

    #[must_use]
    pub const fn video_idle_interval(&self) -> Duration {
        Duration::from_millis(self.video_idle_interval_ms)
    }

    #[must_use]
    pub const fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    #[must_use]
    pub const fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}
