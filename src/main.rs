use anyhow::Context;
use clap::Parser;
use serde_json::json;
use stallwatch::config::Options;
use stallwatch::event::{Event, Exception, Stacktrace};
use stallwatch::session::inspector::InspectorSession;
use stallwatch::session::scripted::ScriptedSession;
use stallwatch::session::{CallFrame, DebugSession, PropertyDescriptor, RemoteObject};
use stallwatch::stack_parser::{StackParser, V8StackParser};
use stallwatch::watchdog::HeartbeatMessage;
use stallwatch::AgentBuilder;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Run a simulated host under the agent: it heartbeats, then hangs, then throws.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file, `~/.config/stallwatch/config.toml` if omitted
    #[arg(short, long, env = "STALLWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Inspector of a runtime started with `--inspect`: either its `host:port` or the
    /// `ws://` debugger url. The scripted debuggee is used if omitted
    #[arg(long)]
    inspector: Option<String>,

    /// Override hang threshold
    #[arg(long)]
    threshold_ms: Option<u64>,

    /// Healthy run time before the hang
    #[arg(long, default_value_t = 2000)]
    healthy_ms: u64,

    /// Hang duration
    #[arg(long, default_value_t = 3000)]
    hang_ms: u64,

    /// Enable agent logs
    #[arg(short, long)]
    debug: bool,
}

const STACK: &str = "TypeError: cannot read properties of undefined (reading 'id')
    at lookupUser (/srv/app/lib/users.js:41:17)
    at handleRequest (/srv/app/index.js:12:5)";

fn inspector_session(target: &str) -> InspectorSession {
    if target.starts_with("ws://") {
        InspectorSession::websocket(target)
    } else {
        InspectorSession::discover(target)
    }
}

fn scripted_debuggee() -> (Arc<ScriptedSession>, Arc<ScriptedSession>) {
    let anr = Arc::new(ScriptedSession::new());
    anr.set_stack(vec![
        CallFrame::new("busyLoop", "file:///srv/app/lib/busy.js", 8, 2),
        CallFrame::new("handleRequest", "file:///srv/app/index.js", 11, 4),
    ]);

    let variables = Arc::new(ScriptedSession::new());
    variables.add_object(
        "scope-lookup",
        vec![
            PropertyDescriptor::new("userId", RemoteObject::literal(json!(42))),
            PropertyDescriptor::new("cache", RemoteObject::literal(serde_json::Value::Null)),
        ],
    );
    (anr, variables)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    stallwatch::log::init();

    let mut options = Options::from_file(args.config.as_deref());
    options.debug |= args.debug;
    if let Some(threshold) = args.threshold_ms {
        options.anr_threshold_ms = threshold;
    }
    let poll_interval = options.poll_interval();

    let stop = Arc::new(AtomicBool::new(false));
    let stop_on_signal = stop.clone();
    ctrlc::set_handler(move || stop_on_signal.store(true, Ordering::SeqCst))
        .context("install Ctrl-C handler")?;

    let (anr_session, variables_session, scripted) = match &args.inspector {
        Some(target) => (
            Arc::new(inspector_session(target)) as Arc<dyn DebugSession>,
            Arc::new(inspector_session(target)) as Arc<dyn DebugSession>,
            None,
        ),
        None => {
            let (anr, variables) = scripted_debuggee();
            (
                anr as Arc<dyn DebugSession>,
                variables.clone() as Arc<dyn DebugSession>,
                Some(variables),
            )
        }
    };

    let started = Instant::now();
    let agent = AgentBuilder::new(options)
        .with_anr_session(anr_session)
        .with_variables_session(variables_session)
        .with_heartbeat_source(move || HeartbeatMessage {
            debug_ids: [("/srv/app/index.js".to_string(), "c0ffee00-0000-4000-8000-000000000001".to_string())].into(),
            ..Default::default()
        })
        .build();
    agent.start();

    let healthy_until = started + Duration::from_millis(args.healthy_ms);
    while Instant::now() < healthy_until && !stop.load(Ordering::SeqCst) {
        agent.heartbeat();
        thread::sleep(poll_interval);
    }

    if !stop.load(Ordering::SeqCst) {
        eprintln!("host: hanging for {} ms", args.hang_ms);
        thread::sleep(Duration::from_millis(args.hang_ms));
        agent.heartbeat();
    }

    if let Some(debuggee) = scripted {
        debuggee.throw(
            STACK,
            vec![
                CallFrame::new("lookupUser", "file:///srv/app/lib/users.js", 40, 16)
                    .with_local_scope("scope-lookup"),
                CallFrame::new("handleRequest", "file:///srv/app/index.js", 11, 4),
            ],
            true,
        );

        let frames = V8StackParser::new(agent.options().app_root_path.clone()).parse(STACK, 1);
        let mut event = Event::from_exception(Exception {
            ty: "TypeError".to_string(),
            value: "cannot read properties of undefined (reading 'id')".to_string(),
            stacktrace: Some(Stacktrace { frames }),
            mechanism: None,
        });
        let merged = agent.process_event(&mut event);
        eprintln!("host: {merged} frame(s) enriched with local variables");
        println!("{}", serde_json::to_string_pretty(&event)?);
    }

    agent.stop();
    Ok(())
}
