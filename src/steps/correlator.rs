//! Deferred assertions racing a deadline against streamed events
//!
//! Each scenario handler instance owns one [`Correlator`]. A step that cannot
//! answer immediately arms it with a watch condition, a deadline and the
//! verdict to report if the deadline passes first. Exactly one of the
//! following resolves it: the deadline, a qualifying event, or teardown.
//!
//! ```text
//!   Idle ──arm──▶ Armed ──resolve / expire / stop──▶ Resolved ──take──▶ Idle
//! ```
//!
//! Only the `Armed` state accepts a resolution, so whichever path comes
//! second is a no-op. The deadline is plain data polled by the owning
//! connection task; leaving `Armed` drops it, so no timer outlives its
//! assertion.

use std::time::Duration;

use tokio::time::Instant;

use crate::common::{Error, Result};

/// Message reported when a pending assertion is torn down
pub const STOPPED_MESSAGE: &str = "Scenario stopped before the step completed";

/// Final outcome of a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
}

impl Verdict {
    pub fn fail(message: impl Into<String>) -> Self {
        Verdict::Fail(message.into())
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// An armed assertion waiting for its condition or deadline
#[derive(Debug)]
struct Pending<W> {
    watch: W,
    deadline: Instant,
    on_timeout: Verdict,
}

#[derive(Debug)]
enum Phase<W> {
    Idle,
    Armed(Pending<W>),
    Resolved(Verdict),
}

/// Per-instance holder of at most one deferred assertion
#[derive(Debug)]
pub struct Correlator<W> {
    phase: Phase<W>,
}

impl<W> Default for Correlator<W> {
    fn default() -> Self {
        Self { phase: Phase::Idle }
    }
}

impl<W> Correlator<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `watch`, reporting `on_timeout` once `timeout` elapses
    pub fn arm(&mut self, watch: W, timeout: Duration, on_timeout: Verdict) -> Result<()> {
        if !matches!(self.phase, Phase::Idle) {
            return Err(Error::AssertionPending);
        }

        tracing::debug!(?timeout, ?on_timeout, "Arming deferred assertion");
        self.phase = Phase::Armed(Pending {
            watch,
            deadline: Instant::now() + timeout,
            on_timeout,
        });
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.phase, Phase::Armed(_))
    }

    /// The condition being waited for, while armed
    pub fn watch(&self) -> Option<&W> {
        match &self.phase {
            Phase::Armed(pending) => Some(&pending.watch),
            _ => None,
        }
    }

    /// When the armed assertion times out
    pub fn deadline(&self) -> Option<Instant> {
        match &self.phase {
            Phase::Armed(pending) => Some(pending.deadline),
            _ => None,
        }
    }

    /// Resolve with `verdict` if still armed. Returns whether this call resolved it.
    pub fn resolve(&mut self, verdict: Verdict) -> bool {
        if !self.is_armed() {
            return false;
        }
        tracing::debug!(?verdict, "Deferred assertion resolved");
        self.phase = Phase::Resolved(verdict);
        true
    }

    /// Resolve with whatever `decide` returns for the current watch, if anything
    pub fn resolve_with<F>(&mut self, decide: F) -> bool
    where
        F: FnOnce(&W) -> Option<Verdict>,
    {
        match self.watch().and_then(decide) {
            Some(verdict) => self.resolve(verdict),
            None => false,
        }
    }

    /// Apply the timeout verdict if the deadline has passed
    pub fn expire(&mut self, now: Instant) -> bool {
        let on_timeout = match &self.phase {
            Phase::Armed(pending) if pending.deadline <= now => pending.on_timeout.clone(),
            _ => return false,
        };
        tracing::debug!("Deferred assertion deadline reached");
        self.resolve(on_timeout)
    }

    /// Tear down an armed assertion with the fixed "stopped" failure
    pub fn stop(&mut self) -> bool {
        self.resolve(Verdict::fail(STOPPED_MESSAGE))
    }

    /// Hand out the verdict once, returning to idle
    pub fn take_verdict(&mut self) -> Option<Verdict> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Resolved(verdict) => Some(verdict),
            other => {
                self.phase = other;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn test_event_before_deadline_passes() {
        let mut corr = Correlator::new();
        corr.arm("connected", T, Verdict::fail("Not connected")).unwrap();
        assert!(corr.is_armed());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!corr.expire(Instant::now()));
        assert!(corr.resolve_with(|w| (*w == "connected").then_some(Verdict::Pass)));

        assert_eq!(corr.take_verdict(), Some(Verdict::Pass));
        assert!(corr.is_idle());
        assert_eq!(corr.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_timeout_verdict() {
        let mut corr: Correlator<()> = Correlator::new();
        corr.arm((), T, Verdict::fail("Not connected")).unwrap();
        let deadline = corr.deadline().unwrap();

        tokio::time::advance(T).await;
        assert!(Instant::now() >= deadline);
        assert!(corr.expire(Instant::now()));
        assert_eq!(corr.take_verdict(), Some(Verdict::fail("Not connected")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_may_be_a_pass() {
        let mut corr: Correlator<()> = Correlator::new();
        corr.arm((), T, Verdict::Pass).unwrap();
        tokio::time::advance(T + Duration::from_millis(1)).await;
        assert!(corr.expire(Instant::now()));
        assert_eq!(corr.take_verdict(), Some(Verdict::Pass));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_fires_once() {
        let mut corr: Correlator<()> = Correlator::new();
        corr.arm((), T, Verdict::fail("timeout")).unwrap();

        tokio::time::advance(T).await;
        assert!(corr.expire(Instant::now()));
        // A late event and a teardown both lose the race
        assert!(!corr.resolve(Verdict::Pass));
        assert!(!corr.stop());
        assert_eq!(corr.take_verdict(), Some(Verdict::fail("timeout")));
        assert_eq!(corr.take_verdict(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_overrides_configured_outcome() {
        let mut corr: Correlator<()> = Correlator::new();
        corr.arm((), T, Verdict::Pass).unwrap();
        assert!(corr.stop());
        assert_eq!(corr.deadline(), None);

        tokio::time::advance(T * 2).await;
        assert!(!corr.expire(Instant::now()));
        assert_eq!(corr.take_verdict(), Some(Verdict::fail(STOPPED_MESSAGE)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_twice_is_rejected() {
        let mut corr: Correlator<()> = Correlator::new();
        corr.arm((), T, Verdict::Pass).unwrap();
        assert!(matches!(
            corr.arm((), T, Verdict::Pass),
            Err(Error::AssertionPending)
        ));

        // Unclaimed verdicts also block re-arming
        corr.resolve(Verdict::Pass);
        assert!(corr.arm((), T, Verdict::Pass).is_err());
        corr.take_verdict();
        assert!(corr.arm((), T, Verdict::Pass).is_ok());
    }

    #[test]
    fn test_idle_ignores_everything() {
        let mut corr: Correlator<()> = Correlator::new();
        assert!(!corr.resolve(Verdict::Pass));
        assert!(!corr.stop());
        assert!(!corr.expire(Instant::now()));
        assert_eq!(corr.take_verdict(), None);
    }
}
