#![allow(dead_code)]

use serde_json::{json, Value};
use stallwatch::event::{Event, Exception, Stacktrace};
use stallwatch::frame::StackFrame;
use stallwatch::session::transport::{ws_split, MessageRead, MessageWrite, WsWriter};
use stallwatch::session::{CallFrame, PropertyDescriptor};
use stallwatch::stack_parser::{StackParser, V8StackParser};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `cond` until it holds or the timeout expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// V8 stack text, `frames` go from the throw site outward.
pub fn stack_text(message: &str, frames: &[(&str, u32, u32)]) -> String {
    let mut text = message.to_string();
    for (function, line, col) in frames {
        text.push_str(&format!("\n    at {function} (/srv/app/main.js:{line}:{col})"));
    }
    text
}

/// Error event as the host SDK would build it from a stack text.
pub fn error_event(stack: &str) -> Event {
    let frames: Vec<StackFrame> = V8StackParser::default().parse(stack, 1);
    Event::from_exception(Exception {
        ty: "Error".to_string(),
        value: stack.lines().next().unwrap_or_default().to_string(),
        stacktrace: Some(Stacktrace { frames }),
        mechanism: None,
    })
}

pub fn event_frames(event: &Event) -> &[StackFrame] {
    &event
        .exceptions()
        .next()
        .unwrap()
        .stacktrace
        .as_ref()
        .unwrap()
        .frames
}

#[derive(Default)]
pub struct PeerState {
    pub modes: Vec<String>,
    pub enables: u32,
    pub pause_requests: u32,
    pub resumes: u32,
    pub property_requests: u32,
    pub paused: bool,
    /// Frames reported by a requested pause.
    pub stack: Vec<CallFrame>,
    pub objects: HashMap<String, Vec<PropertyDescriptor>>,
}

type Peer = Arc<Mutex<WsWriter>>;

/// In-test inspector: answers the commands its sessions send and broadcasts debugger events
/// to every attached session.
pub struct FakeInspector {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<PeerState>>,
    peers: Arc<Mutex<Vec<Peer>>>,
    connections: mpsc::Receiver<()>,
}

const TARGET_ID: &str = "0f1e2d3c";

fn send(peer: &Peer, message: &Value) {
    let _ = peer.lock().unwrap().write_message(message);
}

fn broadcast(peers: &Mutex<Vec<Peer>>, message: &Value) {
    for peer in peers.lock().unwrap().iter() {
        send(peer, message);
    }
}

fn serve(
    mut reader: impl MessageRead,
    me: Peer,
    state: Arc<Mutex<PeerState>>,
    peers: Arc<Mutex<Vec<Peer>>>,
) {
    while let Ok(request) = reader.read_message() {
        let id = request["id"].clone();
        let params = &request["params"];
        let method = request["method"].as_str().unwrap_or_default().to_string();

        let mut events = vec![];
        let response = match method.as_str() {
            "Debugger.enable" => {
                state.lock().unwrap().enables += 1;
                json!({"id": id, "result": {"debuggerId": "fake"}})
            }
            "Debugger.setPauseOnExceptions" => {
                let mode = params["state"].as_str().unwrap_or_default().to_string();
                state.lock().unwrap().modes.push(mode);
                json!({"id": id, "result": {}})
            }
            "Debugger.pause" => {
                let mut state = state.lock().unwrap();
                state.pause_requests += 1;
                state.paused = true;
                events.push(json!({
                    "method": "Debugger.paused",
                    "params": {"reason": "other", "callFrames": state.stack},
                }));
                json!({"id": id, "result": {}})
            }
            "Debugger.resume" => {
                let mut state = state.lock().unwrap();
                state.resumes += 1;
                if std::mem::take(&mut state.paused) {
                    events.push(json!({"method": "Debugger.resumed", "params": {}}));
                }
                json!({"id": id, "result": {}})
            }
            "Runtime.getProperties" => {
                let mut state = state.lock().unwrap();
                state.property_requests += 1;
                let object_id = params["objectId"].as_str().unwrap_or_default();
                match state.objects.get(object_id) {
                    Some(props) if state.paused => json!({"id": id, "result": {"result": props}}),
                    _ => json!({"id": id, "error": {"code": -32000, "message": "Could not find object with given id"}}),
                }
            }
            _ => json!({"id": id, "result": {}}),
        };

        send(&me, &response);
        for event in events {
            broadcast(&peers, &event);
        }
    }
}

/// Plain HTTP request for the target listing rather than a WebSocket upgrade.
fn is_listing(stream: &TcpStream) -> bool {
    let mut head = [0u8; 9];
    for _ in 0..200 {
        match stream.peek(&mut head) {
            Ok(n) if n == head.len() => return head.starts_with(b"GET /json"),
            Ok(0) | Err(_) => return false,
            Ok(_) => thread::sleep(Duration::from_millis(1)),
        }
    }
    false
}

fn answer_listing(stream: TcpStream, ws_url: &str) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut line = String::new();
    while reader.read_line(&mut line).is_ok_and(|n| n > 0) && line != "\r\n" {
        line.clear();
    }
    let body = json!([
        {"type": "node", "id": TARGET_ID, "webSocketDebuggerUrl": ws_url},
    ])
    .to_string();
    let mut stream = stream;
    let _ = write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
}

impl FakeInspector {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(PeerState::default()));
        let peers: Arc<Mutex<Vec<Peer>>> = Arc::default();
        let (conn_tx, conn_rx) = mpsc::channel();
        let ws_url = format!("ws://{addr}/{TARGET_ID}");

        let (state2, peers2) = (state.clone(), peers.clone());
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    return;
                };
                if is_listing(&stream) {
                    answer_listing(stream, &ws_url);
                    continue;
                }
                let Ok(socket) = tungstenite::accept(stream) else {
                    continue;
                };
                let (reader, writer) = ws_split(socket).unwrap();
                let me = Arc::new(Mutex::new(writer));
                peers2.lock().unwrap().push(me.clone());
                let _ = conn_tx.send(());
                let (state, peers) = (state2.clone(), peers2.clone());
                thread::spawn(move || serve(reader, me, state, peers));
            }
        });

        Self {
            addr,
            state,
            peers,
            connections: conn_rx,
        }
    }

    /// Debugger url of the only target.
    pub fn url(&self) -> String {
        format!("ws://{}/{TARGET_ID}", self.addr)
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn wait_connection(&self) {
        self.connections.recv_timeout(WAIT_TIMEOUT).unwrap();
    }

    /// Simulate a throw that pauses the debuggee.
    pub fn emit_exception(&self, stack: &str, frames: &[CallFrame]) {
        self.state.lock().unwrap().paused = true;
        broadcast(
            &self.peers,
            &json!({
                "method": "Debugger.paused",
                "params": {
                    "reason": "exception",
                    "data": {"type": "object", "className": "Error", "description": stack},
                    "callFrames": frames,
                },
            }),
        );
    }

    /// Drop every connection from the inspector side.
    pub fn hang_up(&self) {
        for peer in self.peers.lock().unwrap().drain(..) {
            peer.lock().unwrap().close();
        }
    }

    pub fn resumes(&self) -> u32 {
        self.state.lock().unwrap().resumes
    }
}
