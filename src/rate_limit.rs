use crate::error::Error;
use crate::{muted_error, sw_debug};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

/// Backoff before the first doubling.
pub const BASE_BACKOFF_SECS: u64 = 5;
/// Backoff never grows beyond one day.
pub const MAX_BACKOFF_SECS: u64 = 86_400;

const TICK: Duration = Duration::from_secs(1);

pub type EnableFn = Box<dyn Fn() -> Result<(), Error> + Send + Sync>;
pub type DisableFn = Box<dyn Fn(u64) -> Result<(), Error> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterState {
    pub window_count: u32,
    pub backoff_secs: u64,
    /// Seconds left until re-enable, zero when enabled.
    pub disabled_for: u64,
}

struct Counters {
    state: RateLimiterState,
    /// Backoff in force before the last re-enable, an overage right after it escalates from here.
    carried_backoff: Option<u64>,
}

enum Action {
    Nothing,
    Enable,
    Disable(u64),
}

/// Counts expensive captures per one second window and switches capturing off with an
/// exponential backoff when the limit is exceeded.
///
/// Callback failures are logged and swallowed, rate limiting itself never fails.
pub struct RateLimiter {
    max_per_second: u32,
    state: Mutex<Counters>,
    enable: EnableFn,
    disable: DisableFn,
}

impl RateLimiter {
    /// Create a limiter without a ticker, [`RateLimiter::tick`] must be called by the owner.
    ///
    /// # Arguments
    ///
    /// * `max_per_second`: allowed number of increments per window
    /// * `enable`: called when a backoff expires
    /// * `disable`: called with backoff duration (in seconds) when the limit is exceeded
    pub fn new(max_per_second: u32, enable: EnableFn, disable: DisableFn) -> Self {
        Self {
            max_per_second,
            state: Mutex::new(Counters {
                state: RateLimiterState {
                    window_count: 0,
                    backoff_secs: BASE_BACKOFF_SECS,
                    disabled_for: 0,
                },
                carried_backoff: None,
            }),
            enable,
            disable,
        }
    }

    /// Create a limiter ticking once per second on a background thread.
    /// The thread stops when the returned handle is dropped or the limiter is gone.
    pub fn start(
        max_per_second: u32,
        enable: EnableFn,
        disable: DisableFn,
    ) -> (Arc<Self>, TickerHandle) {
        let limiter = Arc::new(Self::new(max_per_second, enable, disable));
        let handle = Self::spawn_ticker(Arc::downgrade(&limiter), TICK);
        (limiter, handle)
    }

    fn spawn_ticker(limiter: Weak<Self>, rate: Duration) -> TickerHandle {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name("stallwatch-rate-limit".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(rate) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
                match limiter.upgrade() {
                    Some(limiter) => limiter.tick(),
                    None => return,
                }
            });
        muted_error!("local-variables", spawned, "rate limiter ticker not started:");
        TickerHandle { _stop: stop_tx }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count one capture attempt toward the current window.
    pub fn increment(&self) {
        let mut counters = self.lock();
        counters.state.window_count = counters.state.window_count.saturating_add(1);
    }

    /// Close current window. Called once per second.
    ///
    /// Re-enabling resets the backoff to its base. An overage in the very first window after
    /// that is sustained overage and keeps doubling the previous backoff instead.
    pub fn tick(&self) {
        let action = {
            let mut counters = self.lock();
            let Counters {
                state,
                carried_backoff,
            } = &mut *counters;
            let action = if state.disabled_for > 0 {
                state.disabled_for -= 1;
                if state.disabled_for == 0 {
                    *carried_backoff = Some(state.backoff_secs);
                    state.backoff_secs = BASE_BACKOFF_SECS;
                    Action::Enable
                } else {
                    Action::Nothing
                }
            } else if state.window_count > self.max_per_second {
                let from = carried_backoff.take().unwrap_or(state.backoff_secs);
                state.backoff_secs = (from * 2).min(MAX_BACKOFF_SECS);
                state.disabled_for = state.backoff_secs;
                Action::Disable(state.backoff_secs)
            } else {
                *carried_backoff = None;
                Action::Nothing
            };
            state.window_count = 0;
            action
        };

        match action {
            Action::Nothing => {}
            Action::Enable => {
                sw_debug!(target: "local-variables", "rate-limit lifted");
                muted_error!("local-variables", (self.enable)(), "enable callback failed:");
            }
            Action::Disable(seconds) => {
                sw_debug!(target: "local-variables", "rate-limit exceeded, disabled for {seconds} seconds");
                muted_error!("local-variables", (self.disable)(seconds), "disable callback failed:");
            }
        }
    }

    pub fn state(&self) -> RateLimiterState {
        self.lock().state
    }

    pub fn is_disabled(&self) -> bool {
        self.lock().state.disabled_for > 0
    }
}

/// Keeps the ticker thread alive, stops it on drop.
pub struct TickerHandle {
    _stop: mpsc::Sender<()>,
}
