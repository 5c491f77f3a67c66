//! Parsing of textual exception stacks into structured frames.

use crate::frame::StackFrame;
use once_cell::sync::Lazy;
use regex::Regex;

/// Max number of frames kept from a single stack (innermost frames win).
pub const STACKTRACE_FRAME_LIMIT: usize = 50;

/// Turns a raw stack text into structured frames in SDK order (outermost first).
pub trait StackParser: Send + Sync {
    /// # Arguments
    ///
    /// * `stack`: raw stack text
    /// * `skip_first_lines`: number of leading lines to ignore (usually the error message)
    fn parse(&self, stack: &str, skip_first_lines: usize) -> Vec<StackFrame>;
}

impl<F> StackParser for F
where
    F: Fn(&str, usize) -> Vec<StackFrame> + Send + Sync,
{
    fn parse(&self, stack: &str, skip_first_lines: usize) -> Vec<StackFrame> {
        self(stack, skip_first_lines)
    }
}

static FRAME_WITH_FN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*at (?P<func>.+?) \((?P<loc>.+)\)\s*$").expect("valid regex"));
static FRAME_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*at (?P<loc>.+?)\s*$").expect("valid regex"));
static LOCATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<file>.+?):(?P<line>\d+)(?::(?P<col>\d+))?$").expect("valid regex")
});

/// Parser for V8 formatted stacks (`    at fn (file:line:col)`).
#[derive(Debug, Clone, Default)]
pub struct V8StackParser {
    app_root: Option<String>,
}

impl V8StackParser {
    pub fn new(app_root: Option<String>) -> Self {
        Self { app_root }
    }

    fn parse_line(&self, line: &str) -> Option<StackFrame> {
        let (function, loc) = if let Some(caps) = FRAME_WITH_FN.captures(line) {
            (Some(caps["func"].to_string()), caps["loc"].to_string())
        } else {
            let caps = FRAME_BARE.captures(line)?;
            (None, caps["loc"].to_string())
        };

        let function = function
            .map(|f| f.strip_prefix("async ").map(ToString::to_string).unwrap_or(f))
            .unwrap_or_else(|| "?".to_string());

        let mut frame = StackFrame {
            function: Some(function),
            ..Default::default()
        };

        match LOCATION.captures(&loc) {
            Some(caps) => {
                let filename = strip_file_scheme(&caps["file"]).to_string();
                frame.lineno = caps["line"].parse().ok();
                frame.colno = caps.name("col").and_then(|c| c.as_str().parse().ok());
                frame.in_app = Some(filename_is_in_app(&filename));
                frame.module = module_from_filename(&filename, self.app_root.as_deref());
                frame.filename = Some(filename);
            }
            None => {
                // `native`, `<anonymous>` and similar pseudo locations
                frame.filename = Some(loc);
                frame.in_app = Some(false);
            }
        }

        Some(frame)
    }
}

impl StackParser for V8StackParser {
    fn parse(&self, stack: &str, skip_first_lines: usize) -> Vec<StackFrame> {
        let mut frames: Vec<_> = stack
            .lines()
            .skip(skip_first_lines)
            .filter_map(|line| self.parse_line(line))
            .take(STACKTRACE_FRAME_LIMIT)
            .collect();
        frames.reverse();
        frames
    }
}

pub(crate) fn strip_file_scheme(url: &str) -> &str {
    url.strip_prefix("file://").unwrap_or(url)
}

/// A frame is "in app" unless it belongs to a dependency or to the runtime itself.
pub fn filename_is_in_app(filename: &str) -> bool {
    let is_builtin = filename.starts_with("node:");
    let is_absolute = filename.starts_with('/')
        || filename.starts_with('\\')
        || filename.get(1..3) == Some(":\\");
    !is_builtin && is_absolute && !filename.contains("/node_modules/")
}

/// Derive a module name from a file name.
///
/// Dependencies are named by their path below `node_modules`, application files by their
/// directory relative to `app_root` (`dir.sub:file`), script extensions are dropped.
pub fn module_from_filename(filename: &str, app_root: Option<&str>) -> Option<String> {
    let filename = filename.replace('\\', "/");
    let (dir, base) = match filename.rfind('/') {
        Some(idx) => (&filename[..idx], &filename[idx + 1..]),
        None => ("", filename.as_str()),
    };
    let base = [".js", ".mjs", ".cjs"]
        .iter()
        .find_map(|ext| base.strip_suffix(ext))
        .unwrap_or(base);

    if dir.is_empty() {
        return Some(base.to_string());
    }

    if let Some(idx) = dir.rfind("/node_modules") {
        let package = dir[idx + "/node_modules".len()..]
            .trim_start_matches('/')
            .replace('/', ".");
        return Some(format!("{package}:{base}"));
    }

    if let Some(root) = app_root {
        let root = root.replace('\\', "/");
        let root = root.trim_end_matches('/');
        if let Some(rest) = dir.strip_prefix(root) {
            if rest.is_empty() || rest.starts_with('/') {
                let module = rest.trim_start_matches('/').replace('/', ".");
                return if module.is_empty() {
                    Some(base.to_string())
                } else {
                    Some(format!("{module}:{base}"))
                };
            }
        }
    }

    Some(base.to_string())
}
