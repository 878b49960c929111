use crate::sampler::Sample;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Externally visible phase of a supervised run.
///
/// A suspect streak is tracked inside `Running`; it is not a phase of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Running,
    /// Target exited on its own (terminal).
    Completed,
    /// Enough consecutive all-blocked samples were seen (terminal).
    ConfirmedDeadlock,
    /// The global timeout elapsed before the target exited (terminal).
    TimedOut,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        self != Phase::Running
    }

    /// Terminal phases that require the supervisor to kill the process group.
    pub fn requires_termination(self) -> bool {
        matches!(self, Phase::ConfirmedDeadlock | Phase::TimedOut)
    }
}

/// Confidence-escalating deadlock classifier.
///
/// Fed one tick per check interval. A deadlock is confirmed only after
/// `threshold` consecutive deadlock-candidate samples; any non-candidate
/// sample resets the streak, inconclusive samples leave it alone. The
/// global-timeout check runs before any sample is taken.
pub struct Classifier {
    threshold: u32,
    global_timeout: Duration,
    phase: Phase,
    streak: u32,
    elapsed: Duration,
}

impl Classifier {
    pub fn new(threshold: u32, global_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            global_timeout,
            phase: Phase::Running,
            streak: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Current run of consecutive candidate samples.
    pub fn streak(&self) -> u32 {
        self.streak
    }

    /// The target process exited. Ignored once a verdict has been reached.
    pub fn complete(&mut self) -> Phase {
        if self.phase == Phase::Running {
            debug!(elapsed_ms = self.elapsed.as_millis() as u64, "target exited");
            self.phase = Phase::Completed;
        }
        self.phase
    }

    /// Check the global timeout only. Used on ticks that do not sample.
    pub fn check_deadline(&mut self, elapsed: Duration) -> Phase {
        if self.phase.is_terminal() {
            return self.phase;
        }
        self.elapsed = self.elapsed.max(elapsed);
        if self.elapsed > self.global_timeout {
            warn!(
                elapsed_secs = self.elapsed.as_secs_f64(),
                timeout_secs = self.global_timeout.as_secs_f64(),
                streak = self.streak,
                "global timeout reached"
            );
            self.phase = Phase::TimedOut;
        }
        self.phase
    }

    /// One sampling tick. `take_sample` is only called if the deadline has
    /// not passed; `None` from it (process gone) is inconclusive.
    pub fn tick<F>(&mut self, elapsed: Duration, take_sample: F) -> Phase
    where
        F: FnOnce() -> Option<Sample>,
    {
        if self.check_deadline(elapsed).is_terminal() {
            return self.phase;
        }

        match take_sample() {
            Some(sample) => self.observe(&sample),
            None => {
                debug!("no sample, process not readable");
                self.phase
            }
        }
    }

    fn observe(&mut self, sample: &Sample) -> Phase {
        if sample.is_inconclusive() {
            debug!(streak = self.streak, "inconclusive sample");
            return self.phase;
        }

        if sample.is_deadlock_candidate() {
            self.streak += 1;
            debug!(
                streak = self.streak,
                threshold = self.threshold,
                threads = sample.threads.len(),
                "all threads blocked"
            );
        } else {
            if self.streak > 0 {
                debug!(streak = self.streak, "progress observed, streak reset");
            }
            self.streak = 0;
        }

        if self.streak >= self.threshold {
            warn!(
                streak = self.streak,
                elapsed_secs = self.elapsed.as_secs_f64(),
                "deadlock confirmed"
            );
            self.phase = Phase::ConfirmedDeadlock;
        }
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::ThreadState;

    fn blocked() -> Option<Sample> {
        Some(Sample::new(
            [(1, ThreadState::Blocked), (2, ThreadState::Blocked)].into(),
        ))
    }

    fn busy() -> Option<Sample> {
        Some(Sample::new(
            [(1, ThreadState::Blocked), (2, ThreadState::Running)].into(),
        ))
    }

    fn empty() -> Option<Sample> {
        Some(Sample::new(Default::default()))
    }

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn classifier() -> Classifier {
        Classifier::new(3, Duration::from_secs(300))
    }

    #[test]
    fn test_initial_state() {
        let c = classifier();
        assert_eq!(c.phase(), Phase::Running);
        assert_eq!(c.streak(), 0);
    }

    #[test]
    fn test_confirms_exactly_at_threshold() {
        let mut c = classifier();
        assert_eq!(c.tick(secs(0.5), blocked), Phase::Running);
        assert_eq!(c.streak(), 1);
        assert_eq!(c.tick(secs(1.0), blocked), Phase::Running);
        assert_eq!(c.streak(), 2);
        assert_eq!(c.tick(secs(1.5), blocked), Phase::ConfirmedDeadlock);
        assert_eq!(c.streak(), 3);
    }

    #[test]
    fn test_non_candidate_resets_streak() {
        let mut c = classifier();
        c.tick(secs(0.5), blocked);
        c.tick(secs(1.0), blocked);
        assert_eq!(c.tick(secs(1.5), busy), Phase::Running);
        assert_eq!(c.streak(), 0);
        c.tick(secs(2.0), blocked);
        c.tick(secs(2.5), blocked);
        assert_eq!(c.phase(), Phase::Running);
        assert_eq!(c.tick(secs(3.0), blocked), Phase::ConfirmedDeadlock);
    }

    #[test]
    fn test_inconclusive_sample_neither_advances_nor_resets() {
        let mut c = classifier();
        c.tick(secs(0.5), blocked);
        c.tick(secs(1.0), blocked);
        assert_eq!(c.tick(secs(1.5), empty), Phase::Running);
        assert_eq!(c.streak(), 2);
        assert_eq!(c.tick(secs(2.0), || None), Phase::Running);
        assert_eq!(c.streak(), 2);
        assert_eq!(c.tick(secs(2.5), blocked), Phase::ConfirmedDeadlock);
    }

    #[test]
    fn test_timeout_has_priority_over_streak() {
        let mut c = Classifier::new(3, Duration::from_secs(1));
        c.tick(secs(0.5), blocked);
        c.tick(secs(1.0), blocked);
        let mut sampled = false;
        let phase = c.tick(secs(1.5), || {
            sampled = true;
            blocked()
        });
        assert_eq!(phase, Phase::TimedOut);
        assert!(!sampled, "sample must not be taken after the deadline");
        assert_eq!(c.phase(), Phase::TimedOut);
    }

    #[test]
    fn test_timeout_at_boundary_does_not_fire() {
        let mut c = Classifier::new(3, Duration::from_secs(1));
        assert_eq!(c.check_deadline(secs(1.0)), Phase::Running);
        assert_eq!(c.check_deadline(secs(1.01)), Phase::TimedOut);
    }

    #[test]
    fn test_complete_is_terminal() {
        let mut c = classifier();
        c.tick(secs(0.5), blocked);
        assert_eq!(c.complete(), Phase::Completed);
        assert_eq!(c.tick(secs(1.0), blocked), Phase::Completed);
        assert_eq!(c.check_deadline(secs(1000.0)), Phase::Completed);
    }

    #[test]
    fn test_verdict_survives_late_exit() {
        let mut c = Classifier::new(1, Duration::from_secs(300));
        assert_eq!(c.tick(secs(0.5), blocked), Phase::ConfirmedDeadlock);
        assert_eq!(c.complete(), Phase::ConfirmedDeadlock);
    }

    #[test]
    fn test_zero_threshold_clamped_to_one() {
        let mut c = Classifier::new(0, Duration::from_secs(300));
        assert_eq!(c.tick(secs(0.5), busy), Phase::Running);
        assert_eq!(c.tick(secs(1.0), blocked), Phase::ConfirmedDeadlock);
    }

    #[test]
    fn test_requires_termination() {
        assert!(Phase::ConfirmedDeadlock.requires_termination());
        assert!(Phase::TimedOut.requires_termination());
        assert!(!Phase::Completed.requires_termination());
        assert!(!Phase::Running.requires_termination());
    }
}
