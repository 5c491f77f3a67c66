//! Debugger control channel abstraction.
//!
//! A [`DebugSession`] attaches to the inspection channel of the running process, arms
//! pause-on-exception, forces pauses on demand, exposes the call frames of a pause and reads
//! object properties while paused.

pub mod inspector;
pub mod scripted;
pub mod transport;

use crate::error::Error;
use crate::muted_error;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use strum_macros::{Display, EnumString, IntoStaticStr};

/// Which throws trigger a pause.
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, IntoStaticStr)]
pub enum PauseOnExceptions {
    #[strum(serialize = "all")]
    All,
    #[strum(serialize = "uncaught")]
    Uncaught,
    #[strum(serialize = "none")]
    None,
}

impl PauseOnExceptions {
    pub fn from_capture_all(capture_all: bool) -> Self {
        if capture_all {
            PauseOnExceptions::All
        } else {
            PauseOnExceptions::Uncaught
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PauseReason {
    Exception,
    PromiseRejection,
    /// Manual pause (`pause_now`) or any other reason.
    Other,
}

impl From<&str> for PauseReason {
    fn from(reason: &str) -> Self {
        match reason {
            "exception" => PauseReason::Exception,
            "promiseRejection" => PauseReason::PromiseRejection,
            _ => PauseReason::Other,
        }
    }
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::Exception => "exception",
            PauseReason::PromiseRejection => "promiseRejection",
            PauseReason::Other => "other",
        }
    }

    pub fn is_throw(&self) -> bool {
        matches!(self, PauseReason::Exception | PauseReason::PromiseRejection)
    }
}

/// Mirror of a remote value, valid for the duration of a single pause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type", default)]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Literal value. `Some(Null)` is a present null literal.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

/// Keeps `"value": null` distinguishable from an absent value.
fn present_value<'de, D>(de: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(de).map(Some)
}

impl RemoteObject {
    pub fn object(class_name: &str, object_id: &str) -> Self {
        Self {
            ty: "object".to_string(),
            class_name: Some(class_name.to_string()),
            object_id: Some(object_id.to_string()),
            ..Default::default()
        }
    }

    pub fn array(object_id: &str) -> Self {
        Self {
            subtype: Some("array".to_string()),
            ..Self::object("Array", object_id)
        }
    }

    pub fn literal(value: serde_json::Value) -> Self {
        let ty = match &value {
            serde_json::Value::Null => "object",
            serde_json::Value::Bool(_) => "boolean",
            serde_json::Value::Number(_) => "number",
            serde_json::Value::String(_) => "string",
            _ => "object",
        };
        Self {
            ty: ty.to_string(),
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn undefined() -> Self {
        Self {
            ty: "undefined".to_string(),
            ..Default::default()
        }
    }

    pub fn described(ty: &str, description: &str) -> Self {
        Self {
            ty: ty.to_string(),
            description: Some(description.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<RemoteObject>,
}

impl PropertyDescriptor {
    pub fn new(name: &str, value: RemoteObject) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    pub ty: String,
    pub object: RemoteObject,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub script_id: String,
    /// 0-based.
    pub line_number: u32,
    /// 0-based.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_number: Option<u32>,
}

/// A single frame of the paused call stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    #[serde(default)]
    pub call_frame_id: String,
    #[serde(default)]
    pub function_name: String,
    pub location: Location,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub scope_chain: Vec<Scope>,
    #[serde(rename = "this", default)]
    pub this: RemoteObject,
}

impl CallFrame {
    pub fn new(function_name: &str, url: &str, line_number: u32, column_number: u32) -> Self {
        Self {
            function_name: function_name.to_string(),
            url: url.to_string(),
            location: Location {
                script_id: String::new(),
                line_number,
                column_number: Some(column_number),
            },
            ..Default::default()
        }
    }

    /// Attach a local scope backed by an object id.
    pub fn with_local_scope(mut self, object_id: &str) -> Self {
        self.scope_chain.push(Scope {
            ty: "local".to_string(),
            object: RemoteObject::object("Object", object_id),
        });
        self
    }

    pub fn with_this_class(mut self, class_name: &str) -> Self {
        self.this.class_name = Some(class_name.to_string());
        self
    }

    /// Object id of the local scope, if any.
    pub fn local_scope_id(&self) -> Option<&str> {
        self.scope_chain
            .iter()
            .find(|scope| scope.ty == "local")
            .and_then(|scope| scope.object.object_id.as_deref())
    }
}

/// Payload of a pause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedEvent {
    pub reason: String,
    /// Thrown value for exception pauses, its description holds the raw stack text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RemoteObject>,
    pub call_frames: Vec<CallFrame>,
}

impl PausedEvent {
    pub fn reason(&self) -> PauseReason {
        PauseReason::from(self.reason.as_str())
    }

    pub fn exception_stack(&self) -> Option<&str> {
        self.data.as_ref().and_then(|d| d.description.as_deref())
    }
}

pub type PauseHandler = Arc<dyn Fn(&PausedEvent) + Send + Sync>;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SessionState {
    Disconnected,
    Connected,
    Paused,
}

/// Capability interface over a debugger control channel.
///
/// `Disconnected -> Connected -> Paused -> Connected -> ... -> Disconnected`. Only one pause at a
/// time: a pause request while paused (or while another request is in flight) is rejected.
/// After every pause a [`DebugSession::resume`] is required on every code path, otherwise the
/// debuggee stays frozen.
pub trait DebugSession: Send + Sync {
    /// Attach to the debug channel, [`Error::Connection`] if there is none.
    fn connect(&self) -> Result<(), Error>;

    /// Detach. Safe to call many times.
    fn disconnect(&self);

    fn state(&self) -> SessionState;

    /// Reconfigure which throws trigger a pause. Idempotent.
    fn set_pause_on_exceptions(&self, mode: PauseOnExceptions) -> Result<(), Error>;

    /// Request a pause at the next safe point. Asynchronous: the pause is delivered to the
    /// handler later, possibly on another thread.
    fn pause_now(&self) -> Result<(), Error>;

    /// Register pause handler, replacing a previous one.
    fn on_paused(&self, handler: PauseHandler);

    /// Unregister pause handler.
    fn remove_pause_handler(&self);

    /// Continue execution after a pause. A no-op when not paused or disconnected.
    fn resume(&self) -> Result<(), Error>;

    /// Shallow property list of an object of the current pause.
    fn get_object_properties(&self, object_id: &str) -> Result<Vec<PropertyDescriptor>, Error>;
}

/// Session of a process without a debug channel. Never connects.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl DebugSession for Detached {
    fn connect(&self) -> Result<(), Error> {
        Err(Error::Connection("no debug channel configured".to_string()))
    }

    fn disconnect(&self) {}

    fn state(&self) -> SessionState {
        SessionState::Disconnected
    }

    fn set_pause_on_exceptions(&self, _: PauseOnExceptions) -> Result<(), Error> {
        Err(Error::NotConnected)
    }

    fn pause_now(&self) -> Result<(), Error> {
        Err(Error::NotConnected)
    }

    fn on_paused(&self, _: PauseHandler) {}

    fn remove_pause_handler(&self) {}

    fn resume(&self) -> Result<(), Error> {
        Ok(())
    }

    fn get_object_properties(&self, _: &str) -> Result<Vec<PropertyDescriptor>, Error> {
        Err(Error::NotConnected)
    }
}

/// Resumes the session when dropped, so every exit path of a pause handler (early returns,
/// errors, panics) releases the debuggee.
pub struct ResumeGuard<'a> {
    session: &'a dyn DebugSession,
    target: &'static str,
}

impl<'a> ResumeGuard<'a> {
    pub fn new(session: &'a dyn DebugSession, target: &'static str) -> Self {
        Self { session, target }
    }
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        muted_error!(self.target, self.session.resume(), "resume:");
    }
}

#[derive(Debug, Clone, Copy)]
struct Machine {
    state: SessionState,
    pause_pending: bool,
}

/// Session state machine shared by the implementations.
#[derive(Debug)]
pub(crate) struct StateCell(Mutex<Machine>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Mutex::new(Machine {
            state: SessionState::Disconnected,
            pause_pending: false,
        }))
    }
}

impl StateCell {
    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn get(&self) -> SessionState {
        self.lock().state
    }

    pub(crate) fn set_connected(&self) {
        let mut m = self.lock();
        m.state = SessionState::Connected;
        m.pause_pending = false;
    }

    pub(crate) fn set_disconnected(&self) {
        let mut m = self.lock();
        m.state = SessionState::Disconnected;
        m.pause_pending = false;
    }

    pub(crate) fn require_connected(&self) -> Result<(), Error> {
        match self.lock().state {
            SessionState::Disconnected => Err(Error::NotConnected),
            _ => Ok(()),
        }
    }

    /// Register a pause request, rejecting nested ones.
    pub(crate) fn request_pause(&self) -> Result<(), Error> {
        let mut m = self.lock();
        match m.state {
            SessionState::Disconnected => Err(Error::NotConnected),
            SessionState::Paused => Err(Error::AlreadyPaused),
            SessionState::Connected if m.pause_pending => Err(Error::AlreadyPaused),
            SessionState::Connected => {
                m.pause_pending = true;
                Ok(())
            }
        }
    }

    /// Forget a pause request that could not be sent.
    pub(crate) fn cancel_pause_request(&self) {
        self.lock().pause_pending = false;
    }

    /// Debuggee stopped. Return `false` if it is already paused or the session is gone.
    pub(crate) fn enter_pause(&self) -> bool {
        let mut m = self.lock();
        if m.state != SessionState::Connected {
            return false;
        }
        m.state = SessionState::Paused;
        m.pause_pending = false;
        true
    }

    /// Debuggee continues. Return `true` if it was paused.
    pub(crate) fn leave_pause(&self) -> bool {
        let mut m = self.lock();
        if m.state != SessionState::Paused {
            return false;
        }
        m.state = SessionState::Connected;
        true
    }

    pub(crate) fn require_paused(&self) -> Result<(), Error> {
        match self.lock().state {
            SessionState::Paused => Ok(()),
            SessionState::Disconnected => Err(Error::NotConnected),
            SessionState::Connected => {
                Err(Error::Capture("object ids are valid during a pause only".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_state_machine() {
        let cell = StateCell::default();
        assert!(matches!(cell.request_pause(), Err(Error::NotConnected)));

        cell.set_connected();
        cell.request_pause().unwrap();
        assert!(matches!(cell.request_pause(), Err(Error::AlreadyPaused)));

        assert!(cell.enter_pause());
        assert_eq!(cell.get(), SessionState::Paused);
        assert!(!cell.enter_pause());
        assert!(matches!(cell.request_pause(), Err(Error::AlreadyPaused)));
        cell.require_paused().unwrap();

        assert!(cell.leave_pause());
        assert!(!cell.leave_pause());
        assert_eq!(cell.get(), SessionState::Connected);

        cell.set_disconnected();
        assert!(!cell.enter_pause());
        assert!(matches!(cell.require_paused(), Err(Error::NotConnected)));
    }

    #[test]
    fn test_pause_mode_strings() {
        assert_eq!(PauseOnExceptions::All.to_string(), "all");
        assert_eq!(
            PauseOnExceptions::from_str("uncaught").unwrap(),
            PauseOnExceptions::Uncaught
        );
        assert_eq!(
            PauseOnExceptions::from_capture_all(false),
            PauseOnExceptions::Uncaught
        );
    }

    #[test]
    fn test_paused_event_from_protocol_json() {
        let raw = serde_json::json!({
            "reason": "exception",
            "data": {"type": "object", "className": "Error", "description": "Error: boom\n    at f (/a.js:1:1)"},
            "callFrames": [{
                "callFrameId": "0",
                "functionName": "f",
                "location": {"scriptId": "7", "lineNumber": 0, "columnNumber": 0},
                "url": "file:///a.js",
                "scopeChain": [
                    {"type": "local", "object": {"type": "object", "objectId": "scope-1"}},
                    {"type": "global", "object": {"type": "object", "objectId": "g"}}
                ],
                "this": {"type": "undefined"}
            }]
        });
        let ev: PausedEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(ev.reason(), PauseReason::Exception);
        assert!(ev.exception_stack().unwrap().starts_with("Error: boom"));
        assert_eq!(ev.call_frames[0].local_scope_id(), Some("scope-1"));
        assert_eq!(ev.call_frames[0].this.class_name, None);
    }

    #[test]
    fn test_null_literal_is_kept() {
        let with_null: RemoteObject =
            serde_json::from_value(serde_json::json!({"type": "object", "subtype": "null", "value": null}))
                .unwrap();
        assert_eq!(with_null.value, Some(serde_json::Value::Null));

        let absent: RemoteObject =
            serde_json::from_value(serde_json::json!({"type": "undefined"})).unwrap();
        assert_eq!(absent.value, None);
    }
}
