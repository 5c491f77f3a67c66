//! In-memory debug session with a scripted debuggee.
//!
//! Used by the test suite and the demo binary. The "debuggee" is driven explicitly: a test
//! throws exceptions with [`ScriptedSession::throw`], sets the current stack for forced pauses
//! and registers the objects that property lookups resolve.

use crate::error::Error;
use crate::session::{
    CallFrame, DebugSession, PauseHandler, PauseOnExceptions, PausedEvent, PauseReason,
    PropertyDescriptor, RemoteObject, SessionState, StateCell,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// What happened to a scripted session so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptStats {
    pub connects: u32,
    pub pause_requests: u32,
    pub pauses: u32,
    pub resumes: u32,
    pub property_requests: u32,
    /// Every accepted `set_pause_on_exceptions` call, in order.
    pub modes: Vec<PauseOnExceptions>,
}

#[derive(Default)]
struct Script {
    mode: Option<PauseOnExceptions>,
    stack: Vec<CallFrame>,
    objects: HashMap<String, Vec<PropertyDescriptor>>,
    broken_objects: HashSet<String>,
    reject_reconfiguration: bool,
    stats: ScriptStats,
}

/// Deterministic [`DebugSession`].
///
/// Pauses are delivered synchronously on the thread that caused them (the thrower, or the
/// caller of `pause_now`).
pub struct ScriptedSession {
    available: bool,
    state: StateCell,
    script: Mutex<Script>,
    handler: Mutex<Option<PauseHandler>>,
}

impl Default for ScriptedSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self {
            available: true,
            state: StateCell::default(),
            script: Mutex::new(Script::default()),
            handler: Mutex::new(None),
        }
    }

    /// Session of a process without a debug channel, connect always fails.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stack reported by a forced pause, innermost frame first.
    pub fn set_stack(&self, frames: Vec<CallFrame>) {
        self.script().stack = frames;
    }

    /// Register an object that property lookups may resolve.
    pub fn add_object(&self, object_id: &str, properties: Vec<PropertyDescriptor>) {
        self.script()
            .objects
            .insert(object_id.to_string(), properties);
    }

    /// Make every lookup of the object fail.
    pub fn break_object(&self, object_id: &str) {
        self.script().broken_objects.insert(object_id.to_string());
    }

    /// Make `set_pause_on_exceptions` fail from now on.
    pub fn reject_reconfiguration(&self, reject: bool) {
        self.script().reject_reconfiguration = reject;
    }

    pub fn stats(&self) -> ScriptStats {
        self.script().stats.clone()
    }

    pub fn pause_mode(&self) -> Option<PauseOnExceptions> {
        self.script().mode
    }

    /// Throw an exception in the debuggee.
    ///
    /// Pauses if the current mode asks for it. Return `true` if a pause was delivered.
    ///
    /// # Arguments
    ///
    /// * `stack`: exception stack text, as the runtime would print it
    /// * `frames`: debugger call frames at the throw site, innermost first
    /// * `caught`: is there a handler for this exception
    pub fn throw(&self, stack: &str, frames: Vec<CallFrame>, caught: bool) -> bool {
        self.raise(PauseReason::Exception, stack, frames, caught)
    }

    /// Reject a promise nobody handles. Pauses under both `all` and `uncaught`.
    pub fn reject_promise(&self, stack: &str, frames: Vec<CallFrame>) -> bool {
        self.raise(PauseReason::PromiseRejection, stack, frames, false)
    }

    fn raise(&self, reason: PauseReason, stack: &str, frames: Vec<CallFrame>, caught: bool) -> bool {
        let pauses = match self.script().mode {
            Some(PauseOnExceptions::All) => true,
            Some(PauseOnExceptions::Uncaught) => !caught,
            Some(PauseOnExceptions::None) | None => false,
        };
        if !pauses {
            return false;
        }

        let event = PausedEvent {
            reason: reason.as_str().to_string(),
            data: Some(RemoteObject::described("object", stack)),
            call_frames: frames,
        };
        self.deliver(event)
    }

    fn deliver(&self, event: PausedEvent) -> bool {
        if !self.state.enter_pause() {
            return false;
        }
        self.script().stats.pauses += 1;

        let handler = self.handler.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match handler {
            Some(handler) => handler(&event),
            None => {
                _ = self.resume();
            }
        }
        true
    }

    /// Pause still waiting for its resume.
    pub fn is_paused(&self) -> bool {
        self.state.get() == SessionState::Paused
    }
}

impl DebugSession for ScriptedSession {
    fn connect(&self) -> Result<(), Error> {
        if !self.available {
            return Err(Error::Connection("no debug channel in this process".to_string()));
        }
        if self.state.get() == SessionState::Disconnected {
            self.state.set_connected();
            self.script().stats.connects += 1;
        }
        Ok(())
    }

    fn disconnect(&self) {
        if self.state.leave_pause() {
            self.script().stats.resumes += 1;
        }
        self.state.set_disconnected();
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn set_pause_on_exceptions(&self, mode: PauseOnExceptions) -> Result<(), Error> {
        self.state.require_connected()?;
        let mut script = self.script();
        if script.reject_reconfiguration {
            return Err(Error::Protocol("setPauseOnExceptions rejected".to_string()));
        }
        script.mode = Some(mode);
        script.stats.modes.push(mode);
        Ok(())
    }

    fn pause_now(&self) -> Result<(), Error> {
        self.state.request_pause()?;
        let frames = {
            let mut script = self.script();
            script.stats.pause_requests += 1;
            script.stack.clone()
        };
        let event = PausedEvent {
            reason: PauseReason::Other.as_str().to_string(),
            data: None,
            call_frames: frames,
        };
        self.deliver(event);
        Ok(())
    }

    fn on_paused(&self, handler: PauseHandler) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn remove_pause_handler(&self) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn resume(&self) -> Result<(), Error> {
        if self.state.leave_pause() {
            self.script().stats.resumes += 1;
        }
        Ok(())
    }

    fn get_object_properties(&self, object_id: &str) -> Result<Vec<PropertyDescriptor>, Error> {
        self.state.require_paused()?;
        let mut script = self.script();
        script.stats.property_requests += 1;
        if script.broken_objects.contains(object_id) {
            return Err(Error::Capture(format!("object {object_id} was collected")));
        }
        script
            .objects
            .get(object_id)
            .cloned()
            .ok_or_else(|| Error::Capture(format!("unknown object {object_id}")))
    }
}
