//! Local variables of thrown exceptions.
//!
//! The debugger pauses on every throw (or only on uncaught ones), the pause handler reads local
//! scopes of the innermost frames and parks them in a [`VariableCache`] under a hash of the
//! exception stack. When the host later builds the error event, [`LocalVariables::process_event`]
//! recomputes the hash from parsed frames and attaches the variables.

pub mod unroll;

use crate::cache::VariableCache;
use crate::config::Options;
use crate::correlator::{hash_frames, hash_from_stack, merge_captured_frames};
use crate::error::Error;
use crate::event::Event;
use crate::frame::CapturedFrame;
use crate::rate_limit::{RateLimiter, TickerHandle};
use crate::session::{DebugSession, PauseOnExceptions, PausedEvent, ResumeGuard};
use crate::stack_parser::StackParser;
use crate::{muted_error, sw_debug, sw_info, sw_warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use unroll::{qualified_name, run_sequence, unroll_scope, MAX_CAPTURED_FRAMES};

const TARGET: &str = "local-variables";

/// State captured by the pause handler. Holds the session weakly, the session owns the handler.
struct PauseCapture {
    session: Weak<dyn DebugSession>,
    cache: Arc<VariableCache>,
    parser: Arc<dyn StackParser>,
    limiter: Option<Arc<RateLimiter>>,
}

impl PauseCapture {
    fn on_pause(&self, event: &PausedEvent) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        // declared first, dropped last: resume after the cache is filled, on every path
        let _resume = ResumeGuard::new(session.as_ref(), TARGET);

        if !event.reason().is_throw() {
            return;
        }

        if let Some(limiter) = &self.limiter {
            limiter.increment();
        }

        let Some(hash) = hash_from_stack(self.parser.as_ref(), event.exception_stack()) else {
            return;
        };

        let frames = &event.call_frames[..event.call_frames.len().min(MAX_CAPTURED_FRAMES)];
        let captured: Vec<_> = frames
            .iter()
            .map(|frame| CapturedFrame::bare(qualified_name(frame)))
            .collect();

        let session = session.as_ref();
        let steps = frames.iter().enumerate().map(|(i, frame)| {
            move |captured: &mut Vec<CapturedFrame>| {
                let Some(scope_id) = frame.local_scope_id() else {
                    return;
                };
                if let Some(vars) = muted_error!(TARGET, unroll_scope(session, scope_id)) {
                    captured[i].vars = Some(vars);
                }
            }
        });

        run_sequence(captured, steps, |captured| {
            sw_debug!(target: TARGET, "{} frames captured", captured.len());
            self.cache.set(hash, captured);
        });
    }
}

/// Exception-time variable capture.
pub struct LocalVariables {
    session: Arc<dyn DebugSession>,
    cache: Arc<VariableCache>,
    parser: Arc<dyn StackParser>,
    capture_all: bool,
    max_per_second: u32,
    include_out_of_app_frames: bool,
    active: AtomicBool,
    limiter: Mutex<Option<(Arc<RateLimiter>, TickerHandle)>>,
}

impl LocalVariables {
    pub fn new(session: Arc<dyn DebugSession>, parser: Arc<dyn StackParser>, options: &Options) -> Self {
        Self {
            session,
            cache: Arc::new(VariableCache::default()),
            parser,
            capture_all: options.capture_all_exceptions,
            max_per_second: options.max_exceptions_per_second,
            include_out_of_app_frames: options.include_out_of_app_frames,
            active: AtomicBool::new(false),
            limiter: Mutex::new(None),
        }
    }

    /// Rate limiter switching between `all` and `uncaught`. Caught exceptions are the ones
    /// that may flood, uncaught ones stay captured regardless.
    fn start_limiter(&self) -> (Arc<RateLimiter>, TickerHandle) {
        let on_enable = Arc::downgrade(&self.session);
        let on_disable = on_enable.clone();

        RateLimiter::start(
            self.max_per_second,
            Box::new(move || {
                sw_info!(target: TARGET, "local variables rate-limit lifted");
                match on_enable.upgrade() {
                    Some(session) => session.set_pause_on_exceptions(PauseOnExceptions::All),
                    None => Ok(()),
                }
            }),
            Box::new(move |seconds| {
                sw_info!(
                    target: TARGET,
                    "local variables rate-limit exceeded, capturing of caught exceptions disabled for {seconds} seconds"
                );
                match on_disable.upgrade() {
                    Some(session) => session.set_pause_on_exceptions(PauseOnExceptions::Uncaught),
                    None => Ok(()),
                }
            }),
        )
    }

    /// Connect the session, install the pause handler and arm pause-on-exceptions.
    ///
    /// On error the integration stays inactive and [`LocalVariables::process_event`] leaves
    /// events untouched.
    pub fn setup(&self) -> Result<(), Error> {
        if self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.session.connect()?;

        let limiter = self.capture_all.then(|| self.start_limiter());

        let capture = PauseCapture {
            session: Arc::downgrade(&self.session),
            cache: self.cache.clone(),
            parser: self.parser.clone(),
            limiter: limiter.as_ref().map(|(limiter, _)| limiter.clone()),
        };
        self.session
            .on_paused(Arc::new(move |event| capture.on_pause(event)));

        let mode = PauseOnExceptions::from_capture_all(self.capture_all);
        if let Err(e) = self.session.set_pause_on_exceptions(mode) {
            self.session.remove_pause_handler();
            return Err(e);
        }

        *self.limiter.lock().unwrap_or_else(|e| e.into_inner()) = limiter;
        self.active.store(true, Ordering::SeqCst);
        sw_debug!(target: TARGET, "pause on exceptions: {mode}");
        Ok(())
    }

    /// Like [`LocalVariables::setup`], but failures only switch the integration off.
    pub fn setup_or_disable(&self) -> bool {
        match self.setup() {
            Ok(()) => true,
            Err(e) => {
                sw_warn!(target: TARGET, "local variables integration failed to start: {e}");
                false
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Attach cached variables to every exception of the event. Return number of frames that
    /// got variables.
    pub fn process_event(&self, event: &mut Event) -> usize {
        if !self.is_active() {
            return 0;
        }

        let mut merged = 0;
        for exception in event.exceptions_mut() {
            let Some(stacktrace) = exception.stacktrace.as_mut() else {
                continue;
            };
            let Some(hash) = hash_frames(Some(&stacktrace.frames)) else {
                continue;
            };
            let Some(captured) = self.cache.remove(&hash) else {
                continue;
            };
            merged += merge_captured_frames(
                &mut stacktrace.frames,
                &captured,
                self.include_out_of_app_frames,
            );
        }
        merged
    }

    pub fn cached_frames_count(&self) -> usize {
        self.cache.len()
    }

    /// Uninstall the pause handler, disarm pause-on-exceptions and stop the rate limiter.
    /// The session itself is left connected, its owner disconnects it.
    pub fn teardown(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.session.remove_pause_handler();
        muted_error!(
            TARGET,
            self.session.set_pause_on_exceptions(PauseOnExceptions::None)
        );
        self.limiter.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl Drop for LocalVariables {
    fn drop(&mut self) {
        self.teardown();
    }
}
