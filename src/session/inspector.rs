//! Debug session over the inspector protocol WebSocket.
//!
//! Requests are `{"id", "method", "params"}` objects, answered by `{"id", "result"}` or
//! `{"id", "error"}`. Everything without an id is an event. Only the `Debugger.paused` and
//! `Debugger.resumed` events are of interest here.

use crate::error::Error;
use crate::session::transport::{discover_ws_url, ws_connect, MessageRead, MessageWrite};
use crate::session::{
    DebugSession, PauseHandler, PauseOnExceptions, PausedEvent, PropertyDescriptor, SessionState,
    StateCell,
};
use crate::{muted_error, sw_debug, sw_error, weak_error};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type Channel = (Box<dyn MessageRead>, Box<dyn MessageWrite>);

/// Opens a fresh channel to the inspector.
pub type Connector = Box<dyn Fn() -> Result<Channel, Error> + Send + Sync>;

type Pending = HashMap<u64, mpsc::Sender<Result<Value, Error>>>;

struct Shared {
    state: StateCell,
    writer: Mutex<Option<Box<dyn MessageWrite>>>,
    pending: Mutex<Pending>,
    handler: Mutex<Option<PauseHandler>>,
    next_id: AtomicU64,
    /// Incremented by every connect and disconnect, stale reader threads compare against it.
    generation: AtomicU64,
}

impl Shared {
    fn writer(&self) -> MutexGuard<'_, Option<Box<dyn MessageWrite>>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handler(&self) -> Option<PauseHandler> {
        self.handler.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write(&self, id: u64, method: &str, params: Value) -> Result<(), Error> {
        let message = json!({"id": id, "method": method, "params": params});
        match self.writer().as_mut() {
            Some(writer) => writer.write_message(&message),
            None => Err(Error::NotConnected),
        }
    }

    /// Send a command and wait for its response.
    fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.pending().insert(id, tx);

        if let Err(e) = self.write(id, method, params) {
            self.pending().remove(&id);
            return Err(e);
        }

        match rx.recv_timeout(REQUEST_TIMEOUT) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.pending().remove(&id);
                Err(Error::Protocol(format!("{method}: no response")))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::NotConnected),
        }
    }

    /// Send a command without waiting for the response.
    fn notify(&self, method: &str, params: Value) -> Result<(), Error> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.write(id, method, params)
    }

    fn resume(&self) -> Result<(), Error> {
        if !self.state.leave_pause() {
            return Ok(());
        }
        self.notify("Debugger.resume", json!({}))
    }

    fn drop_connection(&self) {
        self.state.set_disconnected();
        if let Some(mut writer) = self.writer().take() {
            writer.close();
        }
        // dropped senders wake up waiting callers with `NotConnected`
        self.pending().clear();
    }

    fn connection_lost(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) == generation {
            sw_debug!(target: "inspector", "inspector channel lost");
            self.drop_connection();
        }
    }

    fn route_response(&self, id: u64, message: &Value) {
        let Some(tx) = self.pending().remove(&id) else {
            return;
        };
        let result = match message.get("error") {
            Some(err) => Err(Error::Protocol(
                err.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            )),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        _ = tx.send(result);
    }
}

fn read_loop(
    shared: Arc<Shared>,
    mut reader: Box<dyn MessageRead>,
    events: mpsc::Sender<PausedEvent>,
    generation: u64,
) {
    loop {
        let message = match reader.read_message() {
            Ok(message) => message,
            Err(e) => {
                sw_debug!(target: "inspector", "read: {e}");
                break;
            }
        };

        if let Some(id) = message.get("id").and_then(Value::as_u64) {
            shared.route_response(id, &message);
            continue;
        }

        match message.get("method").and_then(Value::as_str) {
            Some("Debugger.paused") => {
                let params = message.get("params").cloned().unwrap_or_default();
                let Some(event) = weak_error!(
                    "inspector",
                    serde_json::from_value::<PausedEvent>(params),
                    "malformed pause event:"
                ) else {
                    // nobody can handle it, never leave the debuggee stopped
                    muted_error!("inspector", shared.notify("Debugger.resume", json!({})));
                    continue;
                };
                if !shared.state.enter_pause() {
                    // a pause is already being handled, this one has no owner
                    sw_debug!(target: "inspector", "unexpected pause ({}), resume", event.reason);
                    muted_error!("inspector", shared.notify("Debugger.resume", json!({})));
                    continue;
                }
                if events.send(event).is_err() {
                    break;
                }
            }
            Some("Debugger.resumed") => {
                shared.state.leave_pause();
            }
            _ => {}
        }
    }
    shared.connection_lost(generation);
}

fn dispatch_loop(shared: Arc<Shared>, events: mpsc::Receiver<PausedEvent>) {
    for event in events {
        match shared.handler() {
            Some(handler) => {
                if panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                    sw_error!(target: "inspector", "pause handler panicked");
                    muted_error!("inspector", shared.resume());
                }
            }
            None => {
                muted_error!("inspector", shared.resume());
            }
        }
    }
}

/// [`DebugSession`] speaking to a live inspector.
///
/// Two threads serve an open channel: the reader routes responses to waiting callers and
/// forwards pause events to the dispatcher, the dispatcher runs the pause handler. Keeping
/// them apart lets a handler issue blocking requests while the reader keeps reading.
pub struct InspectorSession {
    connector: Connector,
    shared: Arc<Shared>,
    connect_lock: Mutex<()>,
}

impl InspectorSession {
    pub fn new(connector: Connector) -> Self {
        Self {
            connector,
            shared: Arc::new(Shared {
                state: StateCell::default(),
                writer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                handler: Mutex::new(None),
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
            }),
            connect_lock: Mutex::new(()),
        }
    }

    /// Session connecting to a debugger WebSocket url (`ws://host:port/<target id>`).
    pub fn websocket(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(Box::new(move || {
            let (reader, writer) = ws_connect(&url, CONNECT_TIMEOUT)?;
            Ok((Box::new(reader) as Box<dyn MessageRead>, Box::new(writer) as Box<dyn MessageWrite>))
        }))
    }

    /// Session connecting to the inspector listening on `addr` (`host:port`, e.g. the
    /// `--inspect` default `127.0.0.1:9229`). The debugger url is looked up on every connect,
    /// a restarted runtime gets a new one.
    pub fn discover(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self::new(Box::new(move || {
            let url = discover_ws_url(&addr, CONNECT_TIMEOUT)?;
            let (reader, writer) = ws_connect(&url, CONNECT_TIMEOUT)?;
            Ok((Box::new(reader) as Box<dyn MessageRead>, Box::new(writer) as Box<dyn MessageWrite>))
        }))
    }

    fn spawn_threads(
        &self,
        reader: Box<dyn MessageRead>,
        generation: u64,
    ) -> Result<(), std::io::Error> {
        let (events_tx, events_rx) = mpsc::channel();

        let shared = self.shared.clone();
        thread::Builder::new()
            .name("stallwatch-inspector-dispatch".to_string())
            .spawn(move || dispatch_loop(shared, events_rx))?;

        let shared = self.shared.clone();
        thread::Builder::new()
            .name("stallwatch-inspector-read".to_string())
            .spawn(move || read_loop(shared, reader, events_tx, generation))?;
        Ok(())
    }
}

impl DebugSession for InspectorSession {
    fn connect(&self) -> Result<(), Error> {
        let _guard = self.connect_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.shared.state.get() != SessionState::Disconnected {
            return Ok(());
        }

        let (reader, writer) = (self.connector)().map_err(|e| match e {
            Error::Connection(_) => e,
            other => Error::Connection(other.to_string()),
        })?;

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.writer() = Some(writer);
        self.shared.state.set_connected();

        if let Err(e) = self.spawn_threads(reader, generation) {
            self.shared.drop_connection();
            return Err(Error::Connection(format!("inspector threads: {e}")));
        }

        if let Err(e) = self.shared.call("Debugger.enable", json!({})) {
            self.disconnect();
            return Err(Error::Connection(format!("Debugger.enable: {e}")));
        }

        sw_debug!(target: "inspector", "connected");
        Ok(())
    }

    fn disconnect(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        muted_error!("inspector", self.shared.resume());
        self.shared.drop_connection();
    }

    fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    fn set_pause_on_exceptions(&self, mode: PauseOnExceptions) -> Result<(), Error> {
        self.shared.state.require_connected()?;
        self.shared
            .call("Debugger.setPauseOnExceptions", json!({"state": mode.to_string()}))
            .map(|_| ())
    }

    fn pause_now(&self) -> Result<(), Error> {
        self.shared.state.request_pause()?;
        if let Err(e) = self.shared.notify("Debugger.pause", json!({})) {
            self.shared.state.cancel_pause_request();
            return Err(e);
        }
        Ok(())
    }

    fn on_paused(&self, handler: PauseHandler) {
        *self.shared.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn remove_pause_handler(&self) {
        *self.shared.handler.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn resume(&self) -> Result<(), Error> {
        self.shared.resume()
    }

    fn get_object_properties(&self, object_id: &str) -> Result<Vec<PropertyDescriptor>, Error> {
        self.shared.state.require_paused()?;
        let result = self
            .shared
            .call(
                "Runtime.getProperties",
                json!({"objectId": object_id, "ownProperties": true}),
            )
            .map_err(|e| Error::Capture(format!("getProperties({object_id}): {e}")))?;

        let properties = result.get("result").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(properties)
            .map_err(|e| Error::Capture(format!("getProperties({object_id}): {e}")))
    }
}

impl Drop for InspectorSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}
