//! Per-slot restart backoff.
//!
//! A [`RestartPolicy`] holds no timer of its own. The scheduler loop sweeps
//! every slot on a fixed tick (and right after abnormal transitions) and
//! asks the policy whether a restart is due. Stopping a policy is therefore
//! a flag flip: there is nothing left running that could resurrect a slot.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Default initial backoff between restarts.
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(10);

/// Default ceiling for the backoff.
pub const DEFAULT_RESTART_MAX_DELAY: Duration = Duration::from_secs(300);

/// Restart tuning, configurable per version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicyConfig {
    /// Wait before the second restart, in seconds. The first is immediate.
    pub backoff_secs: u64,

    /// Growth factor applied after each restart.
    pub factor: f64,

    /// Ceiling for the backoff, in seconds.
    pub max_delay_secs: u64,

    /// Give up after this many restarts. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            backoff_secs: DEFAULT_RESTART_BACKOFF.as_secs(),
            factor: 1.0,
            max_delay_secs: DEFAULT_RESTART_MAX_DELAY.as_secs(),
            max_retries: None,
        }
    }
}

impl RestartPolicyConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

/// Backoff and arming state for one slot.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    config: RestartPolicyConfig,
    current_backoff: Duration,
    last_triggered: Option<Instant>,
    retries: u32,
    stopped: bool,
}

impl RestartPolicy {
    /// Creates an armed policy.
    pub fn new(config: RestartPolicyConfig) -> Self {
        let current_backoff = config.backoff().min(config.max_delay());
        Self {
            config,
            current_backoff,
            last_triggered: None,
            retries: 0,
            stopped: false,
        }
    }

    /// Rebuilds a policy from persisted fields.
    pub fn restore(config: RestartPolicyConfig, retries: u32, stopped: bool) -> Self {
        let mut policy = Self::new(config);
        policy.retries = retries;
        policy.stopped = stopped;
        policy
    }

    pub fn config(&self) -> &RestartPolicyConfig {
        &self.config
    }

    pub fn is_armed(&self) -> bool {
        !self.stopped
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    /// Disarms the policy. Returns `true` if it was armed.
    pub fn stop(&mut self) -> bool {
        let was_armed = !self.stopped;
        self.stopped = true;
        was_armed
    }

    /// True when the retry budget is spent.
    pub fn exhausted(&self) -> bool {
        self.config
            .max_retries
            .is_some_and(|max| self.retries >= max)
    }

    /// True when an armed policy may restart at `now`.
    pub fn due(&self, now: Instant) -> bool {
        if self.stopped {
            return false;
        }
        match self.last_triggered {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.current_backoff,
        }
    }

    /// Records a restart at `now` and grows the backoff for the next one.
    pub fn record_restart(&mut self, now: Instant) {
        if self.last_triggered.is_some() {
            self.current_backoff = self.grown_backoff();
        }
        self.last_triggered = Some(now);
        self.retries = self.retries.saturating_add(1);
    }

    /// Next backoff, clamped to the ceiling before it becomes a `Duration`.
    fn grown_backoff(&self) -> Duration {
        let max = self.config.max_delay();
        let grown = self.current_backoff.as_secs_f64() * self.config.factor.max(1.0);
        if grown.is_finite() && grown < max.as_secs_f64() {
            Duration::from_secs_f64(grown)
        } else {
            max
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backoff_secs: u64, factor: f64, max_delay_secs: u64) -> RestartPolicyConfig {
        RestartPolicyConfig {
            backoff_secs,
            factor,
            max_delay_secs,
            max_retries: None,
        }
    }

    #[test]
    fn test_defaults() {
        let config = RestartPolicyConfig::default();
        assert_eq!(config.backoff(), Duration::from_secs(10));
        assert_eq!(config.factor, 1.0);
        assert_eq!(config.max_delay(), Duration::from_secs(300));
        assert!(RestartPolicy::new(config).is_armed());
    }

    #[test]
    fn test_first_restart_is_immediate() {
        let policy = RestartPolicy::new(config(10, 1.0, 300));
        assert!(policy.due(Instant::now()));
    }

    #[test]
    fn test_backoff_between_restarts() {
        let mut policy = RestartPolicy::new(config(10, 1.0, 300));
        let t0 = Instant::now();
        policy.record_restart(t0);

        assert!(!policy.due(t0 + Duration::from_secs(9)));
        assert!(policy.due(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_backoff_grows_to_ceiling() {
        let mut policy = RestartPolicy::new(config(10, 2.0, 30));
        let mut now = Instant::now();
        policy.record_restart(now);
        assert_eq!(policy.current_backoff(), Duration::from_secs(10));

        now += Duration::from_secs(10);
        policy.record_restart(now);
        assert_eq!(policy.current_backoff(), Duration::from_secs(20));

        now += Duration::from_secs(20);
        policy.record_restart(now);
        assert_eq!(policy.current_backoff(), Duration::from_secs(30));

        now += Duration::from_secs(30);
        policy.record_restart(now);
        assert_eq!(policy.current_backoff(), Duration::from_secs(30));
        assert_eq!(policy.retries(), 4);
    }

    #[test]
    fn test_huge_factor_saturates_at_ceiling() {
        let mut policy = RestartPolicy::new(config(10, 1e300, 300));
        let mut now = Instant::now();
        for _ in 0..4 {
            policy.record_restart(now);
            now += policy.current_backoff();
        }
        assert_eq!(policy.current_backoff(), Duration::from_secs(300));

        let mut policy = RestartPolicy::new(config(10, f64::INFINITY, 60));
        policy.record_restart(now);
        policy.record_restart(now);
        assert_eq!(policy.current_backoff(), Duration::from_secs(60));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut policy = RestartPolicy::new(RestartPolicyConfig::default());
        assert!(policy.stop());
        assert!(!policy.stop());
        assert!(!policy.is_armed());
        assert!(!policy.due(Instant::now()));
    }

    #[test]
    fn test_retry_budget() {
        let mut policy = RestartPolicy::new(RestartPolicyConfig {
            max_retries: Some(2),
            ..RestartPolicyConfig::default()
        });
        let now = Instant::now();
        policy.record_restart(now);
        assert!(!policy.exhausted());
        policy.record_restart(now);
        assert!(policy.exhausted());
    }

    #[test]
    fn test_restore_keeps_stopped_flag() {
        let policy = RestartPolicy::restore(RestartPolicyConfig::default(), 3, true);
        assert!(!policy.is_armed());
        assert_eq!(policy.retries(), 3);
    }
}
