//! Host-facing entry point.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stallwatch::agent::AgentBuilder;
//! use stallwatch::config::Options;
//! use stallwatch::session::inspector::InspectorSession;
//!
//! let agent = AgentBuilder::new(Options::from_file(None))
//!     .with_anr_session(Arc::new(InspectorSession::discover("127.0.0.1:9229")))
//!     .with_variables_session(Arc::new(InspectorSession::discover("127.0.0.1:9229")))
//!     .build();
//! agent.start();
//! loop {
//!     agent.heartbeat();
//!     // ... one iteration of the host main loop
//! #   break;
//! }
//! ```

use crate::capture::LocalVariables;
use crate::config::Options;
use crate::error::Error;
use crate::event::Event;
use crate::session::{DebugSession, Detached};
use crate::stack_parser::{StackParser, V8StackParser};
use crate::transport::{Endpoint, Transport};
use crate::watchdog::worker::Watchdog;
use crate::watchdog::{HeartbeatMessage, WatchdogConfig};
use crate::{muted_error, sw_debug, sw_warn, weak_error};
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

const TARGET: &str = "agent";

pub type TransportFactory = Box<dyn Fn() -> Result<Box<dyn Transport>, Error> + Send + Sync>;
pub type HeartbeatSource = Box<dyn Fn() -> HeartbeatMessage + Send + Sync>;

pub struct AgentBuilder {
    options: Options,
    anr_session: Option<Arc<dyn DebugSession>>,
    variables_session: Option<Arc<dyn DebugSession>>,
    transport: Option<TransportFactory>,
    parser: Option<Arc<dyn StackParser>>,
    heartbeat_source: Option<HeartbeatSource>,
}

impl AgentBuilder {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            anr_session: None,
            variables_session: None,
            transport: None,
            parser: None,
            heartbeat_source: None,
        }
    }

    /// Debug session used by the watchdog worker to pause a hung host.
    /// Without it hangs are reported without a stack trace.
    pub fn with_anr_session(self, session: Arc<dyn DebugSession>) -> Self {
        Self {
            anr_session: Some(session),
            ..self
        }
    }

    /// Debug session for exception-time variable capture.
    /// Without it local variables are not captured.
    pub fn with_variables_session(self, session: Arc<dyn DebugSession>) -> Self {
        Self {
            variables_session: Some(session),
            ..self
        }
    }

    /// Single-use report transport. A restarted agent needs a factory instead.
    pub fn with_transport(self, transport: impl Transport + 'static) -> Self {
        let slot: Mutex<Option<Box<dyn Transport>>> = Mutex::new(Some(Box::new(transport)));
        self.with_transport_factory(move || {
            slot.lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .ok_or_else(|| Error::Transport("transport already taken".to_string()))
        })
    }

    pub fn with_transport_factory<F>(self, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Transport>, Error> + Send + Sync + 'static,
    {
        Self {
            transport: Some(Box::new(factory)),
            ..self
        }
    }

    /// Parser of exception stack texts, must be the one the host SDK uses.
    pub fn with_stack_parser(self, parser: Arc<dyn StackParser>) -> Self {
        Self {
            parser: Some(parser),
            ..self
        }
    }

    /// Host state sent with every heartbeat (session, debug ids, scope).
    pub fn with_heartbeat_source<F>(self, source: F) -> Self
    where
        F: Fn() -> HeartbeatMessage + Send + Sync + 'static,
    {
        Self {
            heartbeat_source: Some(Box::new(source)),
            ..self
        }
    }

    pub fn build(self) -> Agent {
        if self.options.debug {
            crate::log::enable();
        }
        let options = self.options.validated();

        let parser = self
            .parser
            .unwrap_or_else(|| Arc::new(V8StackParser::new(options.app_root_path.clone())));

        let transport = self
            .transport
            .unwrap_or_else(|| endpoint_transport(options.endpoint.clone()));

        let local_variables = self
            .variables_session
            .clone()
            .map(|session| LocalVariables::new(session, parser, &options));

        Agent {
            anr_session: self.anr_session.unwrap_or_else(|| Arc::new(Detached)),
            variables_session: self.variables_session,
            transport,
            heartbeat_source: self.heartbeat_source,
            local_variables,
            inner: Mutex::new(Inner::default()),
            options,
        }
    }
}

/// Transport opened from an endpoint descriptor on every start.
fn endpoint_transport(endpoint: String) -> TransportFactory {
    Box::new(move || Endpoint::from_str(&endpoint)?.open())
}

#[derive(Default)]
struct Inner {
    started: bool,
    watchdog: Option<Watchdog>,
    /// Hang detection is off for the rest of the process lifetime.
    anr_disabled: bool,
    /// Number of active [`AnrSuppression`] guards.
    suppressions: usize,
    last_heartbeat: Option<Instant>,
}

/// Coordinates the hang watchdog and the variable capture.
pub struct Agent {
    options: Options,
    anr_session: Arc<dyn DebugSession>,
    variables_session: Option<Arc<dyn DebugSession>>,
    transport: TransportFactory,
    heartbeat_source: Option<HeartbeatSource>,
    local_variables: Option<LocalVariables>,
    inner: Mutex<Inner>,
}

impl Agent {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Start both detectors. Subsequent calls are no-ops until [`Agent::stop`].
    pub fn start(&self) {
        let mut inner = self.inner();
        if inner.started {
            return;
        }
        inner.started = true;

        if let Some(lv) = &self.local_variables {
            lv.setup_or_disable();
        }
        self.start_watchdog(&mut inner);
        sw_debug!(target: TARGET, "started");
    }

    fn start_watchdog(&self, inner: &mut Inner) {
        if inner.anr_disabled || inner.watchdog.is_some() {
            return;
        }

        let Some(transport) = weak_error!(TARGET, (self.transport)(), "ANR transport:") else {
            inner.anr_disabled = true;
            return;
        };

        let config = WatchdogConfig::from(&self.options);
        match Watchdog::spawn(config, self.anr_session.clone(), transport) {
            Ok(watchdog) => {
                if inner.suppressions > 0 {
                    muted_error!(TARGET, watchdog.suspend());
                }
                inner.last_heartbeat = None;
                inner.watchdog = Some(watchdog);
            }
            Err(e) => {
                sw_warn!(target: TARGET, "hang detection disabled: {e}");
                inner.anr_disabled = true;
            }
        }
    }

    /// Stop both detectors. Safe to call many times and on a never started agent.
    pub fn stop(&self) {
        let mut inner = self.inner();
        if !inner.started {
            return;
        }
        inner.started = false;

        if let Some(mut watchdog) = inner.watchdog.take() {
            weak_error!(TARGET, watchdog.stop());
        }
        if let Some(lv) = &self.local_variables {
            lv.teardown();
        }
        if let Some(session) = &self.variables_session {
            session.disconnect();
        }
        sw_debug!(target: TARGET, "stopped");
    }

    /// Liveness signal, call it from the host main loop. Calls closer than the poll interval
    /// to the previous one are dropped.
    pub fn heartbeat(&self) {
        {
            let mut inner = self.inner();
            if inner.watchdog.is_none() {
                return;
            }
            let now = Instant::now();
            if let Some(last) = inner.last_heartbeat {
                if now.saturating_duration_since(last) < self.options.poll_interval() {
                    return;
                }
            }
            inner.last_heartbeat = Some(now);
        }

        // host callback runs outside of the lock
        let message = self
            .heartbeat_source
            .as_ref()
            .map(|source| source())
            .unwrap_or_default();

        let mut inner = self.inner();
        let Some(watchdog) = &inner.watchdog else {
            return;
        };
        if let Err(e) = watchdog.heartbeat(message) {
            sw_warn!(target: TARGET, "hang detection disabled: {e}");
            inner.watchdog = None;
            inner.anr_disabled = true;
        }
    }

    /// True while the watchdog worker runs.
    pub fn is_anr_running(&self) -> bool {
        self.inner()
            .watchdog
            .as_ref()
            .map(Watchdog::is_alive)
            .unwrap_or(false)
    }

    /// Suspend hang detection while the returned guard lives. Guards nest, detection restarts
    /// when the last one is dropped (also during unwinding).
    pub fn suppress_anr(&self) -> AnrSuppression<'_> {
        let mut inner = self.inner();
        inner.suppressions += 1;
        if inner.suppressions == 1 {
            if let Some(watchdog) = &inner.watchdog {
                muted_error!(TARGET, watchdog.suspend());
            }
        }
        AnrSuppression { agent: self }
    }

    fn release_suppression(&self) {
        let mut inner = self.inner();
        inner.suppressions = inner.suppressions.saturating_sub(1);
        if inner.suppressions == 0 {
            if let Some(watchdog) = &inner.watchdog {
                muted_error!(TARGET, watchdog.resume());
            }
        }
    }

    /// Run a callback with hang detection switched off.
    pub fn disable_anr_detection_for_callback<R>(&self, callback: impl FnOnce() -> R) -> R {
        let _suppression = self.suppress_anr();
        callback()
    }

    /// Await a future with hang detection switched off. Detection restarts when the future
    /// completes or is dropped.
    pub async fn disable_anr_detection_for_future<F: Future>(&self, future: F) -> F::Output {
        let _suppression = self.suppress_anr();
        future.await
    }

    /// Attach captured local variables to the exceptions of an outgoing event.
    pub fn process_event(&self, event: &mut Event) -> usize {
        match &self.local_variables {
            Some(lv) => lv.process_event(event),
            None => 0,
        }
    }

    pub fn local_variables(&self) -> Option<&LocalVariables> {
        self.local_variables.as_ref()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}

/// See [`Agent::suppress_anr`].
pub struct AnrSuppression<'a> {
    agent: &'a Agent,
}

impl Drop for AnrSuppression<'_> {
    fn drop(&mut self) {
        self.agent.release_suppression();
    }
}
