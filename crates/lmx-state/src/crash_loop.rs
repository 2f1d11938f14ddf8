//! Crash-loop detection over the persisted startup history

use crate::RuntimeState;
use chrono::{DateTime, Utc};
use lmx_core::StateConfig;
use serde::Serialize;
use std::time::Duration;

/// Counts rapid restarts inside a trailing window
#[derive(Debug, Clone, Copy)]
pub struct CrashLoopDetector {
    threshold: u32,
    window: Duration,
}

/// Outcome of a crash-loop evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrashLoopVerdict {
    pub safe_mode: bool,
    pub recent_startups: usize,
    pub threshold: u32,
    pub window_secs: u64,
}

impl CrashLoopDetector {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
        }
    }

    pub fn from_config(config: &StateConfig) -> Self {
        Self::new(config.crash_loop_threshold, config.crash_loop_window())
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn within_window(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        // timestamps from the future (clock stepped back) count as recent
        let age = (now - at).to_std().unwrap_or(Duration::ZERO);
        age <= self.window
    }

    /// Append a startup at `now` and drop entries that fell out of the window
    pub fn record(&self, history: &mut Vec<DateTime<Utc>>, now: DateTime<Utc>) {
        history.push(now);
        history.retain(|at| self.within_window(*at, now));
    }

    /// Evaluate the startup history stored in `state`
    pub fn evaluate(&self, state: &RuntimeState, now: DateTime<Utc>) -> CrashLoopVerdict {
        let recent = state
            .recent_startups
            .iter()
            .filter(|at| self.within_window(**at, now))
            .count();

        CrashLoopVerdict {
            safe_mode: recent >= self.threshold as usize,
            recent_startups: recent,
            threshold: self.threshold,
            window_secs: self.window.as_secs(),
        }
    }
}

impl Default for CrashLoopDetector {
    fn default() -> Self {
        Self::from_config(&StateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(history: Vec<DateTime<Utc>>) -> RuntimeState {
        let mut state = RuntimeState::first_run(1);
        state.recent_startups = history;
        state
    }

    #[test]
    fn test_three_startups_within_window_trigger_safe_mode() {
        let detector = CrashLoopDetector::new(3, Duration::from_secs(60));
        let now = Utc::now();
        let mut history = Vec::new();

        detector.record(&mut history, now - chrono::Duration::seconds(20));
        detector.record(&mut history, now - chrono::Duration::seconds(10));
        assert!(!detector.evaluate(&state_with(history.clone()), now).safe_mode);

        detector.record(&mut history, now);
        let verdict = detector.evaluate(&state_with(history), now);
        assert!(verdict.safe_mode);
        assert_eq!(verdict.recent_startups, 3);
    }

    #[test]
    fn test_startups_outside_window_are_pruned() {
        let detector = CrashLoopDetector::new(3, Duration::from_secs(60));
        let now = Utc::now();
        let mut history = vec![
            now - chrono::Duration::seconds(300),
            now - chrono::Duration::seconds(120),
        ];

        detector.record(&mut history, now);
        assert_eq!(history.len(), 1);
        assert!(!detector.evaluate(&state_with(history), now).safe_mode);
    }

    #[test]
    fn test_spread_out_restarts_never_trigger() {
        let detector = CrashLoopDetector::new(3, Duration::from_secs(60));
        let start = Utc::now();
        let mut history = Vec::new();

        for i in 0..10 {
            let now = start + chrono::Duration::seconds(i * 45);
            detector.record(&mut history, now);
            assert!(!detector.evaluate(&state_with(history.clone()), now).safe_mode);
        }
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let detector = CrashLoopDetector::new(0, Duration::from_secs(60));
        assert_eq!(detector.threshold(), 1);
    }
}
