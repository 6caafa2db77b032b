use crate::config::ReconnectConfig;
use crate::transport::DisconnectReason;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_exponent: u32,
    pub blocked_floor: Duration,
    pub rate_limited_floor: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            cap: Duration::from_millis(config.max_ms),
            max_exponent: config.max_exponent,
            blocked_floor: Duration::from_millis(config.blocked_floor_ms),
            rate_limited_floor: Duration::from_millis(config.rate_limited_floor_ms),
        }
    }

    /// `min(cap, base * 2^min(attempts, max_exponent))`, raised to the floor of
    /// rate-limited and blocked disconnects.
    pub fn delay(&self, attempts: u32, reason: DisconnectReason) -> Duration {
        let exponent = attempts.min(self.max_exponent).min(31);
        let wait = self
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.cap);

        match reason {
            DisconnectReason::RateLimited => wait.max(self.rate_limited_floor),
            DisconnectReason::Blocked => wait.max(self.blocked_floor),
            _ => wait,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
