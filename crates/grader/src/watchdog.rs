//! One-shot cancellable timer guarding a single execution.
//!
//! State moves `Armed -> Fired` or `Armed -> Cancelled`, never both. The
//! transition is a compare-exchange, so a cancel racing the timer either
//! prevents the action or observes that it already ran.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

pub struct Watchdog {
    state: Arc<AtomicU8>,
    token: CancellationToken,
    delay: Duration,
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("delay", &self.delay)
            .field("state", &state_name(self.state.load(Ordering::Acquire)))
            .finish()
    }
}

fn state_name(state: u8) -> &'static str {
    match state {
        ARMED => "armed",
        FIRED => "fired",
        _ => "cancelled",
    }
}

impl Watchdog {
    /// Run `on_fire` once after `delay` unless cancelled first.
    ///
    /// Must be called inside a tokio runtime.
    pub fn arm<F>(delay: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(ARMED));
        let token = CancellationToken::new();

        let task_state = Arc::clone(&state);
        let task_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = task_token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if task_state
                        .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        debug!(
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "watchdog fired"
                        );
                        on_fire();
                    }
                }
            }
        });

        Self {
            state,
            token,
            delay,
        }
    }

    /// Disarm the timer.
    ///
    /// Returns true only for the call that prevented the action. Calling
    /// again, or after the action ran, is a no-op returning false.
    pub fn cancel(&self) -> bool {
        let prevented = self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.token.cancel();
        prevented
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}
