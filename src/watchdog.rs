use std::fmt::Display;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::config::{Backoff, WatchdogConfig};
use crate::error::WildError;

/// Every blocking pause in the pipeline goes through this, so tests can record
/// delays instead of waiting them out.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

impl<S: Sleeper + ?Sized> Sleeper for Arc<S> {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Runs idempotent calls on a helper thread under a wall-clock budget and
/// retries them until they succeed.
#[derive(Clone)]
pub struct Watchdog<S: Sleeper = ThreadSleeper> {
    timeout: Duration,
    backoff: Backoff,
    sleeper: S,
}

impl Watchdog<ThreadSleeper> {
    pub fn new(config: WatchdogConfig) -> Self {
        Self::with_sleeper(config, ThreadSleeper)
    }
}

impl<S: Sleeper> Watchdog<S> {
    pub fn with_sleeper(config: WatchdogConfig, sleeper: S) -> Self {
        Self {
            timeout: config.timeout,
            backoff: config.backoff,
            sleeper,
        }
    }

    /// Never returns an error: a failed or hung attempt is abandoned, followed by
    /// a cooldown, then the same call is issued again. Blocks forever if `op`
    /// never succeeds.
    pub fn guard<T, E, F>(&self, label: &str, op: F) -> T
    where
        T: Send + 'static,
        E: Display + Send + 'static,
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut failures = 0u32;
        loop {
            let message = match self.attempt(Arc::clone(&op)) {
                Ok(Ok(value)) => {
                    if failures > 0 {
                        tracing::info!(call = label, failures, "call recovered");
                    }
                    return value;
                }
                Ok(Err(err)) => err.to_string(),
                Err(err) => err.to_string(),
            };
            failures = failures.saturating_add(1);
            let cooldown = self.backoff.delay(failures);
            tracing::warn!(
                call = label,
                failures,
                cooldown_secs = cooldown.as_secs_f64(),
                error = %message,
                "call stalled; cooling down before retry"
            );
            self.sleeper.sleep(cooldown);
        }
    }

    fn attempt<T, E, F>(&self, op: Arc<F>) -> Result<Result<T, E>, WildError>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = thread::Builder::new()
            .name("wildmeta-watchdog".to_string())
            .spawn(move || {
                // the receiver is gone once the attempt was abandoned
                let _ = tx.send(op());
            })
            .map_err(|err| WildError::WorkerPanicked(err.to_string()))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => {
                let _ = handle.join();
                Ok(result)
            }
            // the hung thread is detached and left to finish on its own
            Err(RecvTimeoutError::Timeout) => Err(WildError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                let reason = match handle.join() {
                    Err(payload) => panic_message(payload.as_ref()),
                    Ok(()) => "worker exited without a result".to_string(),
                };
                Err(WildError::WorkerPanicked(reason))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
