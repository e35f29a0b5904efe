//! Fleet-wide spreading of the first update check.
//!
//! Every device derives a fixed offset inside the rollout window from the
//! SHA-256 of its device ID, so a fleet that boots together does not hit the
//! release server at the same instant, and a device keeps its slot across
//! restarts.

use crate::config::TriggerConfig;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

/// Deterministic start offset for the periodic trigger.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RolloutOffset {
    window: Duration,
    device_hash: [u8; 32],
}

impl RolloutOffset {
    /// No offset.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Offset for `device_id` inside `window`.
    #[must_use]
    pub fn new(device_id: &[u8], window: Duration) -> Self {
        let mut device_hash = [0u8; 32];
        device_hash.copy_from_slice(&Sha256::digest(device_id));
        Self {
            window,
            device_hash,
        }
    }

    /// Offset configured by the trigger section, disabled without a device
    /// ID or window.
    #[must_use]
    pub fn from_config(config: &TriggerConfig) -> Self {
        match &config.device_id {
            Some(id) if config.rollout_window_minutes > 0 => Self::new(
                id.as_bytes(),
                Duration::from_secs(config.rollout_window_minutes.saturating_mul(60)),
            ),
            _ => Self::disabled(),
        }
    }

    /// Whether an offset applies.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.window.is_zero()
    }

    /// The rollout window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The offset, always below the window.
    #[must_use]
    pub fn offset(&self) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.device_hash[..8]);
        let hash_value = u128::from(u64::from_le_bytes(prefix));

        let window_ms = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX);
        let scaled = (hash_value * u128::from(window_ms)) >> 64;
        let offset = Duration::from_millis(u64::try_from(scaled).unwrap_or(window_ms));

        debug!(
            "Rollout offset: {}m {}s of {}m window",
            offset.as_secs() / 60,
            offset.as_secs() % 60,
            self.window.as_secs() / 60
        );
        offset
    }
}
