mod common;

use serial_test::serial;
use stallwatch::config::Options;
use stallwatch::session::scripted::ScriptedSession;
use stallwatch::session::CallFrame;
use stallwatch::transport::ChannelTransport;
use stallwatch::watchdog::worker::Watchdog;
use stallwatch::watchdog::{HeartbeatMessage, WatchdogConfig};
use stallwatch::AgentBuilder;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn options(threshold_ms: u64, poll_interval_ms: u64) -> Options {
    Options {
        anr_threshold_ms: threshold_ms,
        poll_interval_ms,
        capture_all_exceptions: false,
        ..Default::default()
    }
}

fn hung_debuggee() -> Arc<ScriptedSession> {
    let session = Arc::new(ScriptedSession::new());
    session.set_stack(vec![
        CallFrame::new("spin", "file:///srv/app/lib/spin.js", 9, 3),
        CallFrame::new("main", "file:///srv/app/index.js", 1, 0),
    ]);
    session
}

#[test]
#[serial]
fn test_hang_reported_once_after_threshold() {
    let session = hung_debuggee();
    let (transport, reports) = ChannelTransport::new();
    let agent = AgentBuilder::new(options(1000, 100))
        .with_anr_session(session.clone())
        .with_transport(transport)
        .build();
    agent.start();
    assert!(agent.is_anr_running());

    // healthy phase
    let healthy_until = Instant::now() + Duration::from_millis(2000);
    let mut last_heartbeat = Instant::now();
    while Instant::now() < healthy_until {
        agent.heartbeat();
        last_heartbeat = Instant::now();
        thread::sleep(Duration::from_millis(100));
    }
    assert!(reports.try_recv().is_err());

    // host hangs for 5 seconds
    let event = reports.recv_timeout(Duration::from_secs(5)).unwrap();
    let waited = last_heartbeat.elapsed();
    assert!(waited >= Duration::from_millis(1000), "reported after {waited:?}");
    assert!(waited < Duration::from_millis(1100), "reported after {waited:?}");

    let exception = event.exceptions().next().unwrap();
    assert_eq!(exception.ty, "ApplicationNotResponding");
    assert_eq!(exception.value, "Application Not Responding for at least 1000 ms");
    let frames = &exception.stacktrace.as_ref().unwrap().frames;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].function.as_deref(), Some("main"));
    assert_eq!(frames[1].function.as_deref(), Some("spin"));
    assert_eq!(frames[1].filename.as_deref(), Some("/srv/app/lib/spin.js"));
    assert_eq!(frames[1].lineno, Some(10));
    assert_eq!(frames[1].colno, Some(4));

    // one report per process by default
    let rest = Duration::from_millis(5000).saturating_sub(last_heartbeat.elapsed());
    assert!(reports.recv_timeout(rest).is_err());

    let stats = session.stats();
    assert_eq!(stats.pause_requests, 1);
    assert_eq!(stats.resumes, 1);
    assert!(!session.is_paused());

    agent.stop();
    assert!(!agent.is_anr_running());
}

#[test]
#[serial]
fn test_steady_heartbeats_never_report() {
    let (transport, reports) = ChannelTransport::new();
    let agent = AgentBuilder::new(options(200, 20))
        .with_anr_session(hung_debuggee())
        .with_transport(transport)
        .build();
    agent.start();

    let until = Instant::now() + Duration::from_millis(1000);
    while Instant::now() < until {
        agent.heartbeat();
        thread::sleep(Duration::from_millis(20));
    }
    agent.stop();

    assert!(reports.try_recv().is_err());
}

#[test]
#[serial]
fn test_report_limit_counts_episodes() {
    let config = WatchdogConfig::from(&Options {
        max_anr_events: 2,
        ..options(100, 10)
    });
    let session = hung_debuggee();
    let (transport, reports) = ChannelTransport::new();
    let mut watchdog = Watchdog::spawn(config, session.clone(), Box::new(transport)).unwrap();

    for _ in 0..3 {
        let _ = reports.recv_timeout(Duration::from_secs(2));
        // a heartbeat ends the episode, the next hang starts a new one
        watchdog.heartbeat(HeartbeatMessage::default()).unwrap();
    }
    assert!(reports.recv_timeout(Duration::from_millis(300)).is_err());
    watchdog.stop().unwrap();

    assert_eq!(session.stats().pause_requests, 2);
}

#[test]
#[serial]
fn test_stack_capture_disabled() {
    let session = hung_debuggee();
    let (transport, reports) = ChannelTransport::new();
    let agent = AgentBuilder::new(Options {
        capture_stack_trace: false,
        ..options(100, 10)
    })
    .with_anr_session(session.clone())
    .with_transport(transport)
    .build();
    agent.start();

    let event = reports.recv_timeout(Duration::from_secs(5)).unwrap();
    agent.stop();

    assert!(event.exceptions().next().unwrap().stacktrace.is_none());
    assert_eq!(session.stats().pause_requests, 0);
}

#[test]
#[serial]
fn test_heartbeat_burst_is_not_a_hang() {
    let config = WatchdogConfig::from(&options(300, 10));
    let (transport, reports) = ChannelTransport::new();
    let mut watchdog = Watchdog::spawn(config, hung_debuggee(), Box::new(transport)).unwrap();

    thread::sleep(Duration::from_millis(150));
    for _ in 0..50 {
        watchdog.heartbeat(HeartbeatMessage::default()).unwrap();
    }
    assert!(reports.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(reports.recv_timeout(Duration::from_secs(2)).is_ok());
    watchdog.stop().unwrap();
}

#[test]
#[serial]
fn test_suppressed_callback_is_not_a_hang() {
    let (transport, reports) = ChannelTransport::new();
    let agent = AgentBuilder::new(options(100, 10))
        .with_anr_session(hung_debuggee())
        .with_transport(transport)
        .build();
    agent.start();
    agent.heartbeat();

    let value = agent.disable_anr_detection_for_callback(|| {
        thread::sleep(Duration::from_millis(400));
        42
    });
    assert_eq!(value, 42);
    assert!(reports.try_recv().is_err());

    // detection comes back with a fresh countdown
    assert!(reports.recv_timeout(Duration::from_secs(2)).is_ok());
    agent.stop();
}

#[test]
#[serial]
fn test_heartbeat_scope_lands_in_report() {
    let (transport, reports) = ChannelTransport::new();
    let agent = AgentBuilder::new(Options {
        release: Some("shop@1.4.0".to_string()),
        ..options(200, 10)
    })
    .with_anr_session(Arc::new(ScriptedSession::unavailable()))
    .with_transport(transport)
    .with_heartbeat_source(|| HeartbeatMessage {
        debug_ids: [("/srv/app/index.js".to_string(), "5b1c".to_string())].into(),
        ..Default::default()
    })
    .build();
    agent.start();
    agent.heartbeat();

    let event = reports.recv_timeout(Duration::from_secs(5)).unwrap();
    agent.stop();

    assert_eq!(event.release.as_deref(), Some("shop@1.4.0"));
    let images = &event.debug_meta.as_ref().unwrap().images;
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].code_file, "/srv/app/index.js");
    assert_eq!(images[0].debug_id, "5b1c");
}
