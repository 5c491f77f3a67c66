//! Outbound delivery of hang reports.
//!
//! The watchdog worker owns its transport: a hung host cannot be asked to deliver anything.

use crate::error::Error;
use crate::event::Event;
use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::mpsc;

pub trait Transport: Send {
    fn send_event(&mut self, event: &Event) -> Result<(), Error>;
}

/// One JSON document per line.
pub struct WriterTransport<W> {
    writer: W,
}

impl<W: Write + Send> WriterTransport<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> Transport for WriterTransport<W> {
    fn send_event(&mut self, event: &Event) -> Result<(), Error> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

pub type FileTransport = WriterTransport<LineWriter<File>>;

/// Hands events over to an in-process receiver.
pub struct ChannelTransport {
    tx: mpsc::Sender<Event>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send_event(&mut self, event: &Event) -> Result<(), Error> {
        self.tx
            .send(event.clone())
            .map_err(|_| Error::Transport("report receiver is gone".to_string()))
    }
}

/// Report destination descriptor: `stderr`, `stdout` or `file:///path/to/reports.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Stderr,
    Stdout,
    File(PathBuf),
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(Endpoint::Stderr),
            "stdout" => Ok(Endpoint::Stdout),
            _ => match s.strip_prefix("file://") {
                Some(path) if !path.is_empty() => Ok(Endpoint::File(PathBuf::from(path))),
                _ => Err(Error::Configuration {
                    field: "endpoint",
                    reason: format!("unknown endpoint `{s}`"),
                }),
            },
        }
    }
}

impl Endpoint {
    pub fn open(&self) -> Result<Box<dyn Transport>, Error> {
        Ok(match self {
            Endpoint::Stderr => Box::new(WriterTransport::new(io::stderr())),
            Endpoint::Stdout => Box::new(WriterTransport::new(io::stdout())),
            Endpoint::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Box::new(FileTransport::new(LineWriter::new(file)))
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::Exception;

    fn event() -> Event {
        Event::from_exception(Exception {
            ty: "ApplicationNotResponding".to_string(),
            value: "hang".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(Endpoint::from_str("stderr").unwrap(), Endpoint::Stderr);
        assert_eq!(
            Endpoint::from_str("file:///tmp/r.jsonl").unwrap(),
            Endpoint::File(PathBuf::from("/tmp/r.jsonl"))
        );
        assert!(matches!(
            Endpoint::from_str("https://example.com"),
            Err(Error::Configuration { field: "endpoint", .. })
        ));
        assert!(Endpoint::from_str("file://").is_err());
    }

    #[test]
    fn test_writer_transport_json_lines() {
        let mut transport = WriterTransport::new(Vec::new());
        transport.send_event(&event()).unwrap();
        transport.send_event(&event()).unwrap();

        let out = String::from_utf8(transport.writer).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Event = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, event());
    }

    #[test]
    fn test_file_endpoint_appends() {
        let path = std::env::temp_dir().join(format!("stallwatch-{}.jsonl", uuid::Uuid::new_v4()));
        let endpoint = Endpoint::File(path.clone());
        endpoint.open().unwrap().send_event(&event()).unwrap();
        endpoint.open().unwrap().send_event(&event()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_channel_transport() {
        let (mut transport, rx) = ChannelTransport::new();
        transport.send_event(&event()).unwrap();
        assert_eq!(rx.recv().unwrap(), event());
        drop(rx);
        assert!(matches!(
            transport.send_event(&event()),
            Err(Error::Transport(_))
        ));
    }
}
