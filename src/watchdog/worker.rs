use crate::error::Error;
use crate::frame::StackFrame;
use crate::session::{DebugSession, PauseReason, PausedEvent, ResumeGuard};
use crate::transport::Transport;
use crate::watchdog::report::{anr_event, convert_call_frames};
use crate::watchdog::{HeartbeatMessage, WatchdogConfig, WatchdogTimer, WorkerMessage};
use crate::{sw_debug, sw_info, sw_warn, weak_error};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TARGET: &str = "anr";

/// How often the worker looks at its timer.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(20);

struct Worker {
    config: WatchdogConfig,
    session: Arc<dyn DebugSession>,
    transport: Box<dyn Transport>,
    timer: WatchdogTimer,
    last_heartbeat: HeartbeatMessage,
    reports_sent: u32,
    /// Debugger is usable for stack capture.
    debugger: bool,
    /// A pause was requested by this worker and not yet delivered.
    pause_requested: bool,
}

impl Worker {
    fn run(mut self, rx: mpsc::Receiver<WorkerMessage>) {
        loop {
            match rx.recv_timeout(CHECK_INTERVAL) {
                Ok(WorkerMessage::Heartbeat(heartbeat)) => {
                    self.timer.poll(Instant::now());
                    self.last_heartbeat = heartbeat;
                }
                Ok(WorkerMessage::Suspend) => {
                    sw_debug!(target: TARGET, "detection suspended");
                    self.timer.set_enabled(false, Instant::now());
                }
                Ok(WorkerMessage::Resume) => {
                    sw_debug!(target: TARGET, "detection resumed");
                    self.timer.set_enabled(true, Instant::now());
                }
                Ok(WorkerMessage::Paused(event)) => self.on_paused(&event),
                Ok(WorkerMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if self.timer.check(Instant::now()) {
                self.on_hang();
            }
        }

        self.session.remove_pause_handler();
        self.session.disconnect();
        sw_debug!(target: TARGET, "worker stopped");
    }

    fn on_hang(&mut self) {
        sw_info!(
            target: TARGET,
            "application not responding for at least {} ms",
            self.config.anr_threshold.as_millis()
        );

        if self.reports_sent >= self.config.max_anr_events {
            sw_debug!(target: TARGET, "report limit ({}) reached, hang not reported", self.config.max_anr_events);
            return;
        }

        if !self.config.capture_stack_trace || !self.debugger {
            self.send_report(None);
            return;
        }

        self.pause_requested = true;
        if let Err(e) = self.session.pause_now() {
            sw_warn!(target: TARGET, "failed to pause the hung thread: {e}");
            self.pause_requested = false;
            self.send_report(None);
        }
    }

    fn on_paused(&mut self, event: &PausedEvent) {
        // exception pauses belong to whoever else shares the debuggee, the owner resumes them
        if event.reason() != PauseReason::Other || !std::mem::take(&mut self.pause_requested) {
            sw_debug!(target: TARGET, "ignore pause not requested by the watchdog ({})", event.reason);
            return;
        }
        let resume = ResumeGuard::new(self.session.as_ref(), TARGET);

        let frames = convert_call_frames(&event.call_frames, self.config.app_root_path.as_deref());
        drop(resume);

        self.send_report(Some(frames));
    }

    fn send_report(&mut self, frames: Option<Vec<StackFrame>>) {
        self.reports_sent += 1;
        let event = anr_event(&self.config, frames, &self.last_heartbeat);
        if weak_error!(TARGET, self.transport.send_event(&event), "send ANR event:").is_some() {
            sw_info!(target: TARGET, "ANR event sent");
        }
    }
}

/// Handle to a running watchdog worker.
pub struct Watchdog {
    tx: mpsc::Sender<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start a worker.
    ///
    /// The worker connects its session first. A session that cannot connect leaves the worker
    /// running without stack capture: hangs are reported without a stack trace.
    pub fn spawn(
        config: WatchdogConfig,
        session: Arc<dyn DebugSession>,
        transport: Box<dyn Transport>,
    ) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel();

        let pause_tx = tx.clone();
        let weak_session = Arc::downgrade(&session);
        let forward_pause = move |event: &PausedEvent| {
            if pause_tx.send(WorkerMessage::Paused(event.clone())).is_err() {
                // worker is gone, nobody else resumes this pause
                if let Some(session) = weak_session.upgrade() {
                    _ = session.resume();
                }
            }
        };

        let thread = thread::Builder::new()
            .name("stallwatch-anr".to_string())
            .spawn(move || {
                let debugger = match session.connect() {
                    Ok(()) => {
                        session.on_paused(Arc::new(forward_pause));
                        true
                    }
                    Err(e) => {
                        sw_warn!(target: TARGET, "debugger unavailable, hangs are reported without stack: {e}");
                        false
                    }
                };

                let worker = Worker {
                    timer: WatchdogTimer::new(Instant::now(), config.anr_threshold),
                    config,
                    session,
                    transport,
                    last_heartbeat: HeartbeatMessage::default(),
                    reports_sent: 0,
                    debugger,
                    pause_requested: false,
                };
                worker.run(rx);
            })
            .map_err(|e| Error::WorkerLifecycle(format!("spawn: {e}")))?;

        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    fn send(&self, message: WorkerMessage) -> Result<(), Error> {
        self.tx
            .send(message)
            .map_err(|_| Error::WorkerLifecycle("worker exited".to_string()))
    }

    pub fn heartbeat(&self, heartbeat: HeartbeatMessage) -> Result<(), Error> {
        self.send(WorkerMessage::Heartbeat(heartbeat))
    }

    /// Stop hang detection until [`Watchdog::resume`].
    pub fn suspend(&self) -> Result<(), Error> {
        self.send(WorkerMessage::Suspend)
    }

    /// Restart hang detection, the countdown starts from now.
    pub fn resume(&self) -> Result<(), Error> {
        self.send(WorkerMessage::Resume)
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| !thread.is_finished())
            .unwrap_or(false)
    }

    /// Stop the worker and wait for it. Safe to call on a dead worker.
    pub fn stop(&mut self) -> Result<(), Error> {
        _ = self.tx.send(WorkerMessage::Stop);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Error::WorkerLifecycle("worker panicked".to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        weak_error!(TARGET, self.stop());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Options;
    use crate::session::scripted::ScriptedSession;
    use crate::session::CallFrame;
    use crate::transport::ChannelTransport;

    fn config(threshold_ms: u64) -> WatchdogConfig {
        WatchdogConfig::from(&Options {
            anr_threshold_ms: threshold_ms,
            poll_interval_ms: 10,
            ..Default::default()
        })
    }

    #[test]
    fn test_report_with_stack() {
        let session = Arc::new(ScriptedSession::new());
        session.set_stack(vec![CallFrame::new("spin", "file:///app/main.js", 4, 2)]);
        let (transport, reports) = ChannelTransport::new();

        let mut watchdog = Watchdog::spawn(config(100), session.clone(), Box::new(transport)).unwrap();
        let event = reports.recv_timeout(Duration::from_secs(5)).unwrap();
        watchdog.stop().unwrap();

        let frames = &event.exceptions().next().unwrap().stacktrace.as_ref().unwrap().frames;
        assert_eq!(frames[0].function.as_deref(), Some("spin"));
        assert_eq!(frames[0].lineno, Some(5));
        assert!(!session.is_paused());
        assert_eq!(session.stats().pause_requests, 1);
        assert_eq!(session.stats().resumes, 1);
    }

    #[test]
    fn test_unavailable_debugger_reports_without_stack() {
        let (transport, reports) = ChannelTransport::new();
        let mut watchdog = Watchdog::spawn(
            config(50),
            Arc::new(ScriptedSession::unavailable()),
            Box::new(transport),
        )
        .unwrap();

        let event = reports.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(event.exceptions().next().unwrap().stacktrace.is_none());
        watchdog.stop().unwrap();
    }

    #[test]
    fn test_suspend_blocks_detection() {
        let session = Arc::new(ScriptedSession::new());
        let (transport, reports) = ChannelTransport::new();
        let mut watchdog = Watchdog::spawn(config(50), session.clone(), Box::new(transport)).unwrap();
        watchdog.suspend().unwrap();

        assert!(reports.recv_timeout(Duration::from_millis(300)).is_err());
        watchdog.resume().unwrap();
        assert!(reports.recv_timeout(Duration::from_secs(5)).is_ok());
        watchdog.stop().unwrap();
    }

    #[test]
    fn test_foreign_exception_pause_left_to_its_owner() {
        let session = Arc::new(ScriptedSession::new());
        let (transport, reports) = ChannelTransport::new();
        let mut watchdog =
            Watchdog::spawn(config(60_000), session.clone(), Box::new(transport)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.stats().connects == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        // handler is installed right after connect
        thread::sleep(Duration::from_millis(50));

        session.set_pause_on_exceptions(crate::session::PauseOnExceptions::All).unwrap();
        assert!(session.throw("Error: boom", vec![CallFrame::new("f", "file:///app/a.js", 0, 0)], true));
        thread::sleep(Duration::from_millis(100));

        assert!(session.is_paused());
        assert_eq!(session.stats().resumes, 0);
        assert!(reports.try_recv().is_err());

        session.resume().unwrap();
        watchdog.stop().unwrap();
    }

    #[test]
    fn test_stop_twice_and_dead_worker() {
        let (transport, _reports) = ChannelTransport::new();
        let mut watchdog =
            Watchdog::spawn(config(1000), Arc::new(ScriptedSession::new()), Box::new(transport)).unwrap();
        assert!(watchdog.is_alive());
        watchdog.stop().unwrap();
        watchdog.stop().unwrap();
        assert!(!watchdog.is_alive());
        assert!(matches!(
            watchdog.heartbeat(HeartbeatMessage::default()),
            Err(Error::WorkerLifecycle(_))
        ));
    }
}
