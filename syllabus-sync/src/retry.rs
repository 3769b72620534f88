//! Bounded retry of Remote Client calls, plus cycle cancellation.
//!
//! Each call gets `max_attempts` tries with exponential backoff between
//! them. Retries also draw from a budget shared by the whole cycle, so a
//! flapping backend cannot stretch one cycle indefinitely.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use syllabus_core::config::RetrySettings;
use syllabus_remote::RemoteError;

use crate::error::SyncError;

const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Shared cancellation request for one cycle.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

pub struct Retrier {
    settings: RetrySettings,
    budget: AtomicU32,
    retries: AtomicU32,
    cancel: CancelFlag,
}

impl Retrier {
    pub fn new(settings: &RetrySettings, cancel: CancelFlag) -> Self {
        Self {
            settings: settings.clone(),
            budget: AtomicU32::new(settings.cycle_budget),
            retries: AtomicU32::new(0),
            cancel,
        }
    }

    /// Retries performed so far in this cycle.
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Run `f`, retrying transient failures.
    ///
    /// Cancellation is checked before every attempt; an attempt already in
    /// flight always runs to completion.
    pub fn call<T>(
        &self,
        what: &str,
        mut f: impl FnMut() -> Result<T, RemoteError>,
    ) -> Result<T, SyncError> {
        let mut attempt = 1;
        loop {
            self.cancel.check()?;
            match f() {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(op = what, attempt, "remote call recovered");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.settings.max_attempts => {
                    if !self.spend() {
                        tracing::warn!(op = what, attempt, "cycle retry budget exhausted");
                        return Err(SyncError::from_remote(err, attempt));
                    }
                    let delay = self.settings.delay_for_retry(attempt);
                    tracing::warn!(
                        op = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient remote failure; retrying"
                    );
                    self.pause(delay)?;
                    attempt += 1;
                }
                Err(err) => return Err(SyncError::from_remote(err, attempt)),
            }
        }
    }

    fn spend(&self) -> bool {
        let spent = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if spent {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }
        spent
    }

    /// Sleep for `delay`, waking early if the cycle is cancelled.
    fn pause(&self, delay: Duration) -> Result<(), SyncError> {
        let mut left = delay;
        while !left.is_zero() {
            self.cancel.check()?;
            let step = left.min(PAUSE_SLICE);
            std::thread::sleep(step);
            left -= step;
        }
        self.cancel.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn flaky(failures: u32) -> impl FnMut() -> Result<&'static str, RemoteError> {
        let mut left = failures;
        move || {
            if left > 0 {
                left -= 1;
                Err(RemoteError::Transient("503".into()))
            } else {
                Ok("ok")
            }
        }
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(4)]
    fn recovers_within_max_attempts(#[case] failures: u32) {
        let retrier = Retrier::new(&RetrySettings::immediate(5), CancelFlag::new());
        assert_eq!(retrier.call("list", flaky(failures)).expect("call"), "ok");
        assert_eq!(retrier.retries(), failures);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let retrier = Retrier::new(&RetrySettings::immediate(3), CancelFlag::new());
        let err = retrier.call("list", flaky(3)).unwrap_err();
        assert!(matches!(err, SyncError::Transient { attempts: 3, .. }), "got: {err}");
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let retrier = Retrier::new(&RetrySettings::immediate(5), CancelFlag::new());
        let mut calls = 0;
        let err = retrier
            .call("create", || -> Result<(), RemoteError> {
                calls += 1;
                Err(RemoteError::Permanent("401".into()))
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Permanent(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn cycle_budget_caps_total_retries() {
        let settings = RetrySettings {
            cycle_budget: 2,
            ..RetrySettings::immediate(10)
        };
        let retrier = Retrier::new(&settings, CancelFlag::new());
        assert!(retrier.call("a", flaky(2)).is_ok());
        let err = retrier.call("b", flaky(1)).unwrap_err();
        assert!(matches!(err, SyncError::Transient { attempts: 1, .. }));
    }

    #[test]
    fn cancelled_flag_stops_new_calls() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let retrier = Retrier::new(&RetrySettings::immediate(3), cancel);
        let mut called = false;
        let err = retrier
            .call("list", || -> Result<(), RemoteError> {
                called = true;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert!(!called);
    }
}
