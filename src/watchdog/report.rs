//! Hang report construction.

use crate::event::{DebugImage, DebugMeta, Event, Exception, Mechanism, SessionInfo, Stacktrace};
use crate::frame::StackFrame;
use crate::session::CallFrame;
use crate::stack_parser::{
    filename_is_in_app, module_from_filename, strip_file_scheme, STACKTRACE_FRAME_LIMIT,
};
use crate::watchdog::{HeartbeatMessage, WatchdogConfig};

pub const ANR_EXCEPTION_TYPE: &str = "ApplicationNotResponding";
pub const ANR_MECHANISM: &str = "ANR";

/// Convert a paused call frame (0-based positions) into a stack frame (1-based positions).
pub fn convert_call_frame(frame: &CallFrame, app_root: Option<&str>) -> StackFrame {
    let filename = strip_file_scheme(&frame.url);
    let function = if frame.function_name.is_empty() {
        "?"
    } else {
        frame.function_name.as_str()
    };

    let mut converted = StackFrame {
        function: Some(function.to_string()),
        lineno: Some(frame.location.line_number + 1),
        colno: frame.location.column_number.map(|c| c + 1),
        ..Default::default()
    };
    if !filename.is_empty() {
        converted.in_app = Some(filename_is_in_app(filename));
        converted.module = module_from_filename(filename, app_root);
        converted.filename = Some(filename.to_string());
    }
    converted
}

/// Paused call stack (innermost first) as a stack trace in SDK order (outermost first).
pub fn convert_call_frames(frames: &[CallFrame], app_root: Option<&str>) -> Vec<StackFrame> {
    let mut converted: Vec<_> = frames
        .iter()
        .take(STACKTRACE_FRAME_LIMIT)
        .map(|frame| convert_call_frame(frame, app_root))
        .collect();
    converted.reverse();
    converted
}

/// Build a hang report.
///
/// # Arguments
///
/// * `config`: worker configuration
/// * `frames`: hung stack, `None` if it could not be captured
/// * `heartbeat`: the latest heartbeat received before the hang
pub fn anr_event(
    config: &WatchdogConfig,
    frames: Option<Vec<StackFrame>>,
    heartbeat: &HeartbeatMessage,
) -> Event {
    let exception = Exception {
        ty: ANR_EXCEPTION_TYPE.to_string(),
        value: format!(
            "Application Not Responding for at least {} ms",
            config.anr_threshold.as_millis()
        ),
        stacktrace: frames.map(|frames| Stacktrace { frames }),
        mechanism: Some(Mechanism {
            ty: ANR_MECHANISM.to_string(),
            handled: Some(false),
        }),
    };

    let mut event = Event::from_exception(exception);
    event.event_id = Some(uuid::Uuid::new_v4().simple().to_string());
    event.timestamp = Some(chrono::Utc::now().to_rfc3339());
    event.platform = Some("node".to_string());
    event.level = Some("error".to_string());
    event.release = config.release.clone();
    event.environment = config.environment.clone();
    event.dist = config.dist.clone();

    event.tags = config
        .static_tags
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
        .collect();
    if let Some(scope) = &heartbeat.scope {
        event
            .tags
            .extend(scope.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        event.contexts = scope.contexts.clone();
    }

    if !heartbeat.debug_ids.is_empty() {
        event.debug_meta = Some(DebugMeta {
            images: heartbeat
                .debug_ids
                .iter()
                .map(|(file, id)| DebugImage {
                    ty: "sourcemap".to_string(),
                    code_file: file.clone(),
                    debug_id: id.clone(),
                })
                .collect(),
        });
    }

    event.session = heartbeat.session.as_ref().map(|session| SessionInfo {
        sid: session.sid.clone(),
        status: "abnormal".to_string(),
    });

    event
}
