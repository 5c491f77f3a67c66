//! Inspector channel transport: JSON messages carried in WebSocket text frames, the way a
//! `--inspect` runtime serves them after the HTTP upgrade.

use crate::error::Error;
use serde::Deserialize;
use serde_json::Value;
use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tungstenite::protocol::WebSocketConfig;
use tungstenite::{Message, WebSocket};

/// Largest accepted inspector message.
pub const MAX_MESSAGE_SIZE: usize = 8 << 20;

/// How long the reader holds the socket before letting writers in.
const READ_SLICE: Duration = Duration::from_millis(5);

/// Receiving half of a channel.
pub trait MessageRead: Send {
    /// Read a single message, blocking until it is available.
    fn read_message(&mut self) -> Result<Value, Error>;
}

/// Sending half of a channel.
pub trait MessageWrite: Send {
    /// Write a single message.
    fn write_message(&mut self, message: &Value) -> Result<(), Error>;

    /// Close the channel, a blocked reader on the other half must wake up.
    fn close(&mut self) {}
}

pub fn ws_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

type SharedSocket = Arc<Mutex<WebSocket<TcpStream>>>;

fn lock(socket: &SharedSocket) -> MutexGuard<'_, WebSocket<TcpStream>> {
    socket.lock().unwrap_or_else(|e| e.into_inner())
}

/// Reading half of a WebSocket channel.
pub struct WsReader {
    socket: SharedSocket,
}

impl MessageRead for WsReader {
    fn read_message(&mut self) -> Result<Value, Error> {
        loop {
            let read = lock(&self.socket).read();
            let message = match read {
                Ok(message) => message,
                Err(tungstenite::Error::Io(e))
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    // socket is released here, give a waiting writer its turn
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match message {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Binary(bytes) => return Ok(serde_json::from_slice(&bytes)?),
                Message::Close(_) => return Err(Error::Protocol("connection closed".to_string())),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

/// Writing half of a WebSocket channel, closing it shuts the socket down in both directions.
pub struct WsWriter {
    socket: SharedSocket,
    stream: TcpStream,
}

impl MessageWrite for WsWriter {
    fn write_message(&mut self, message: &Value) -> Result<(), Error> {
        let text = serde_json::to_string(message)?;
        lock(&self.socket).send(Message::Text(text))?;
        Ok(())
    }

    fn close(&mut self) {
        _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Drop for WsWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Split an open WebSocket into reading and writing halves.
pub fn ws_split(socket: WebSocket<TcpStream>) -> Result<(WsReader, WsWriter), Error> {
    let stream = socket.get_ref().try_clone()?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_SLICE))?;
    let socket = Arc::new(Mutex::new(socket));
    Ok((
        WsReader {
            socket: socket.clone(),
        },
        WsWriter { socket, stream },
    ))
}

fn tcp_connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<TcpStream, Error> {
    let mut last_err = None;
    for addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::Connection(match last_err {
        Some(e) => e.to_string(),
        None => "address resolved to nothing".to_string(),
    }))
}

/// `host:port` part of a `ws://` url.
fn ws_authority(url: &str) -> Result<&str, Error> {
    let rest = url
        .strip_prefix("ws://")
        .ok_or_else(|| Error::Connection(format!("unsupported inspector url: {url}")))?;
    Ok(rest.split_once('/').map_or(rest, |(authority, _)| authority))
}

/// Open a WebSocket to an inspector at `url` (`ws://host:port/<target id>`).
pub fn ws_connect(url: &str, timeout: Duration) -> Result<(WsReader, WsWriter), Error> {
    let stream = tcp_connect(ws_authority(url)?, timeout)?;
    // bounded handshake, a silent peer must not hang the caller
    stream.set_read_timeout(Some(timeout))?;
    let (socket, _) =
        tungstenite::client::client_with_config(url, stream, Some(ws_config(MAX_MESSAGE_SIZE)))
            .map_err(|e| Error::Connection(format!("{url}: {e}")))?;
    ws_split(socket)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InspectorTarget {
    #[serde(rename = "type", default)]
    ty: String,
    web_socket_debugger_url: Option<String>,
}

/// Ask the inspector HTTP endpoint at `addr` (`host:port`) for the debugger url of its
/// first node target.
pub fn discover_ws_url(addr: &str, timeout: Duration) -> Result<String, Error> {
    let targets: Vec<InspectorTarget> = ureq::get(format!("http://{addr}/json/list"))
        .config()
        .timeout_global(Some(timeout))
        .build()
        .call()
        .and_then(|mut response| response.body_mut().read_json())
        .map_err(|e| Error::Connection(format!("{addr}/json/list: {e}")))?;

    targets
        .into_iter()
        .filter(|t| t.ty.is_empty() || t.ty == "node")
        .find_map(|t| t.web_socket_debugger_url)
        .ok_or_else(|| Error::Connection(format!("{addr}: no debuggable target")))
}
