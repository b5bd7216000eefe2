//! Process supervisor with linear restart backoff
//!
//! Each unexpected exit adds a fixed increment to the restart delay. If the
//! last restart happened longer ago than `reset_after`, the delay drops back
//! to zero, so an isolated crash is restarted immediately. Once the delay
//! exceeds the ceiling the supervisor gives up for good.

use std::time::{Duration, Instant};

/// Restart policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Added to the delay on every crash
    pub increment: Duration,
    /// Give up once the delay exceeds this
    pub ceiling: Duration,
    /// A restart older than this no longer counts towards the backoff
    pub reset_after: Duration,
    /// Exit code meaning "do not restart me"
    pub dont_restart_exit_code: i32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            increment: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
            reset_after: Duration::from_secs(60),
            dont_restart_exit_code: 100,
        }
    }
}

/// What to do after the process exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Restart after the given delay (zero means now)
    Restart(Duration),
    /// Restarts are disabled (unload, spawn failure, do-not-restart code)
    Stop,
    /// Backoff exceeded the ceiling
    GiveUp,
}

/// Supervisor state tracking restarts
#[derive(Debug)]
pub struct Supervisor {
    policy: RestartPolicy,
    enabled: bool,
    delay: Duration,
    last_restart: Option<Instant>,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            enabled: true,
            delay: Duration::ZERO,
            last_restart: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Stop restarting until re-enabled
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Re-arm restarts for an explicit (re)load
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Record that a scheduled restart actually ran
    pub fn on_restart(&mut self, now: Instant) {
        self.last_restart = Some(now);
    }

    /// Called when the process exits with `code` (`None` when killed by a signal)
    pub fn on_exit(&mut self, code: Option<i32>, now: Instant) -> ExitDecision {
        if code == Some(self.policy.dont_restart_exit_code) {
            self.enabled = false;
        }
        if !self.enabled {
            return ExitDecision::Stop;
        }

        self.delay += self.policy.increment;

        let stale = match self.last_restart {
            Some(last) => now.duration_since(last) > self.policy.reset_after,
            None => true,
        };
        if stale {
            self.delay = Duration::ZERO;
        }

        if self.delay > self.policy.ceiling {
            self.enabled = false;
            return ExitDecision::GiveUp;
        }

        ExitDecision::Restart(self.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy::default()
    }

    #[test]
    fn test_isolated_crash_restarts_immediately() {
        let mut sup = Supervisor::new(policy());
        let start = Instant::now();
        assert_eq!(
            sup.on_exit(Some(42), start),
            ExitDecision::Restart(Duration::ZERO)
        );
    }

    #[test]
    fn test_rapid_crashes_back_off_then_give_up() {
        let mut sup = Supervisor::new(policy());
        let mut now = Instant::now();
        let mut delays = Vec::new();

        loop {
            match sup.on_exit(Some(1), now) {
                ExitDecision::Restart(delay) => {
                    delays.push(delay);
                    now += delay;
                    sup.on_restart(now);
                    now += Duration::from_millis(100);
                }
                ExitDecision::GiveUp => break,
                ExitDecision::Stop => panic!("unexpected stop"),
            }
        }

        assert_eq!(delays[0], Duration::ZERO);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(30));
        assert_eq!(delays.len(), 31);
        assert!(!sup.is_enabled());
        assert_eq!(sup.on_exit(Some(1), now), ExitDecision::Stop);
    }

    #[test]
    fn test_delay_resets_after_quiet_period() {
        let mut sup = Supervisor::new(policy());
        let mut now = Instant::now();

        for _ in 0..5 {
            if let ExitDecision::Restart(delay) = sup.on_exit(Some(1), now) {
                now += delay;
                sup.on_restart(now);
            }
            now += Duration::from_secs(1);
        }
        assert_eq!(sup.delay(), Duration::from_secs(4));

        now += Duration::from_secs(61);
        assert_eq!(
            sup.on_exit(Some(1), now),
            ExitDecision::Restart(Duration::ZERO)
        );
    }

    #[test]
    fn test_dont_restart_code_stops() {
        let mut sup = Supervisor::new(policy());
        assert_eq!(sup.on_exit(Some(100), Instant::now()), ExitDecision::Stop);
        assert!(!sup.is_enabled());
    }

    #[test]
    fn test_disabled_supervisor_stops() {
        let mut sup = Supervisor::new(policy());
        sup.disable();
        assert_eq!(sup.on_exit(None, Instant::now()), ExitDecision::Stop);
        sup.enable();
        assert!(matches!(
            sup.on_exit(None, Instant::now()),
            ExitDecision::Restart(_)
        ));
    }
}
