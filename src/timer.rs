//! Cancellable timers
//!
//! Every deferred action in the crate (retry backoff, health polling,
//! inactivity watchdog, mode auto-timeouts) goes through these types.
//! Cancelling a timer, or dropping it, guarantees its callback is never
//! invoked afterwards. Anything the callback already queued before the
//! cancellation is the owner's to discard (each owner tags its messages
//! with an id or generation).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One-shot or repeating timer backed by a spawned task
#[derive(Debug)]
pub struct Timer {
    token: CancellationToken,
}

impl Timer {
    /// Run `f` once after `delay`
    pub fn once<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let guard = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = guard.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if !guard.is_cancelled() {
                        f();
                    }
                }
            }
        });
        Self { token }
    }

    /// Run `f` every `period`, first firing one period from now
    pub fn repeating<F>(period: Duration, f: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let token = CancellationToken::new();
        let guard = token.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticks = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    biased;
                    () = guard.cancelled() => return,
                    _ = ticks.tick() => {
                        if guard.is_cancelled() {
                            return;
                        }
                        f();
                    }
                }
            }
        });
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Inactivity timer: fires once unless kicked within every `timeout` window
#[derive(Debug)]
pub struct Watchdog {
    token: CancellationToken,
    kick: Arc<Notify>,
}

impl Watchdog {
    pub fn start<F>(timeout: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let kick = Arc::new(Notify::new());
        let guard = token.clone();
        let kicked = Arc::clone(&kick);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = guard.cancelled() => return,
                    () = kicked.notified() => {}
                    () = tokio::time::sleep(timeout) => break,
                }
            }
            if !guard.is_cancelled() {
                on_expire();
            }
        });
        Self { token, kick }
    }

    /// Restart the inactivity window
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
