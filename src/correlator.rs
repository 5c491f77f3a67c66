//! Correlation of debugger frames with the frames of a parsed exception stack.
//!
//! The debugger and the SDK see the same exception through two different lenses: the debugger
//! reports live call frames at pause time, the SDK parses the exception's stack text later. The
//! only link between the two is a hash of the stack, computed the same way on both sides.

use crate::frame::{CapturedFrame, StackFrame};
use crate::stack_parser::StackParser;
use std::fmt::Write;

/// Number of frames (closest to the throw site) taken into account by [`hash_frames`].
pub const HASH_WINDOW: usize = 10;

/// Synthetic frame present in stack texts but never in debugger call frames.
const PROMISE_CONSTRUCTOR: &str = "new Promise";

/// Create a hash from the last `window` frames of a stack in SDK order.
/// Return `None` for an absent or empty list.
pub fn hash_frames_with_window(frames: Option<&[StackFrame]>, window: usize) -> Option<String> {
    let frames = frames?;
    if frames.is_empty() {
        return None;
    }

    let start = frames.len().saturating_sub(window);
    let mut hash = String::new();
    for frame in &frames[start..] {
        let _ = write!(
            hash,
            ",{},{},{}",
            frame.function.as_deref().unwrap_or_default(),
            frame.lineno.map(|l| l.to_string()).unwrap_or_default(),
            frame.colno.map(|c| c.to_string()).unwrap_or_default(),
        );
    }
    Some(hash)
}

/// Create a hash from the last [`HASH_WINDOW`] frames of a stack in SDK order.
pub fn hash_frames(frames: Option<&[StackFrame]>) -> Option<String> {
    hash_frames_with_window(frames, HASH_WINDOW)
}

/// Hash of a raw stack text. Parsing goes through the same parser the SDK uses for outgoing
/// events, so both sides produce identical keys.
pub fn hash_from_stack(parser: &dyn StackParser, stack: Option<&str>) -> Option<String> {
    let frames = parser.parse(stack?, 1);
    hash_frames(Some(&frames))
}

fn is_anonymous(name: Option<&str>) -> bool {
    matches!(name, Some("" | "?" | "<anonymous>"))
}

/// Do the function names appear to match?
///
/// Bundlers routinely erase names on one side only, so two anonymous names are a match.
pub fn function_names_match(a: Option<&str>, b: Option<&str>) -> bool {
    a == b || (is_anonymous(a) && is_anonymous(b))
}

/// Attach captured variables onto application frames.
///
/// Application frames are walked from the throw site outward and paired position by position
/// with captured frames (innermost first). Pairs are skipped when the captured frame has no
/// variables, the application frame is not in app (unless `include_out_of_app_frames`), or the
/// names do not match. The walk stops at the shorter list. Return the number of frames that got
/// variables.
pub fn merge_captured_frames(
    app_frames: &mut [StackFrame],
    captured: &[CapturedFrame],
    include_out_of_app_frames: bool,
) -> usize {
    let mut merged = 0;

    let app_frames = app_frames
        .iter_mut()
        .rev()
        .filter(|frame| frame.function.as_deref() != Some(PROMISE_CONSTRUCTOR));

    for (frame, captured) in app_frames.zip(captured) {
        let Some(vars) = &captured.vars else {
            continue;
        };
        if frame.in_app == Some(false) && !include_out_of_app_frames {
            continue;
        }
        if !function_names_match(frame.function.as_deref(), Some(&captured.function)) {
            continue;
        }

        frame.vars = Some(vars.clone());
        merged += 1;
    }

    merged
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::Variables;
    use crate::stack_parser::V8StackParser;
    use serde_json::json;

    fn vars(pairs: &[(&str, serde_json::Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_hash_empty_or_absent() {
        assert_eq!(hash_frames(None), None);
        assert_eq!(hash_frames(Some(&[])), None);
    }

    #[test]
    fn test_hash_format() {
        let frames = [StackFrame::new("f1", 30, 3), StackFrame::new("f2", 20, 2)];
        assert_eq!(
            hash_frames(Some(&frames)).as_deref(),
            Some(",f1,30,3,f2,20,2")
        );
    }

    #[test]
    fn test_hash_uses_last_ten_frames() {
        let frames: Vec<_> = (0..15).map(|i| StackFrame::new(format!("f{i}"), i, 1)).collect();
        let full = hash_frames(Some(&frames)).unwrap();
        let tail = hash_frames(Some(&frames[5..])).unwrap();
        assert_eq!(full, tail);
        assert!(!full.contains(",f4,"));
        assert!(full.ends_with(",f14,14,1"));
    }

    #[test]
    fn test_hash_from_stack_matches_structured_frames() {
        let stack = "Error: boom
    at f3 (/app/a.js:10:1)
    at f2 (/app/a.js:20:2)
    at f1 (/app/a.js:30:3)";
        let parser = V8StackParser::default();

        let structured = [
            StackFrame::new("f1", 30, 3),
            StackFrame::new("f2", 20, 2),
            StackFrame::new("f3", 10, 1),
        ];

        assert_eq!(
            hash_from_stack(&parser, Some(stack)),
            hash_frames(Some(&structured))
        );
        assert_eq!(hash_from_stack(&parser, None), None);
        assert_eq!(hash_from_stack(&parser, Some("Error: no frames")), None);
    }

    #[test]
    fn test_function_names_match() {
        assert!(function_names_match(Some("foo"), Some("foo")));
        assert!(!function_names_match(Some("foo"), Some("bar")));
        assert!(function_names_match(Some("?"), Some("<anonymous>")));
        assert!(function_names_match(Some(""), Some("?")));
        assert!(!function_names_match(Some("?"), Some("foo")));
        assert!(!function_names_match(None, Some("?")));
        assert!(function_names_match(None, None));
    }

    #[test]
    fn test_merge_scenario() {
        // SDK order: outermost first
        let mut app = vec![
            StackFrame::new("f1", 30, 3),
            StackFrame::new("f2", 20, 2),
            StackFrame::new("f3", 10, 1),
        ];
        let captured = vec![
            CapturedFrame::with_vars("f3", vars(&[("x", json!(1))])),
            CapturedFrame::bare("f2"),
            CapturedFrame::with_vars("f1", vars(&[("y", json!(2))])),
        ];

        assert_eq!(merge_captured_frames(&mut app, &captured, false), 2);
        assert_eq!(app[2].vars, Some(vars(&[("x", json!(1))])));
        assert_eq!(app[1].vars, None);
        assert_eq!(app[0].vars, Some(vars(&[("y", json!(2))])));
    }

    #[test]
    fn test_merge_different_lengths() {
        let mut app = vec![StackFrame::new("outer", 1, 1), StackFrame::new("inner", 2, 2)];
        let captured: Vec<_> = ["inner", "outer", "main", "start"]
            .iter()
            .map(|f| CapturedFrame::with_vars(*f, vars(&[("v", json!(f))])))
            .collect();

        assert_eq!(merge_captured_frames(&mut app, &captured, false), 2);

        let mut long_app: Vec<_> = (0..6).map(|i| StackFrame::new(format!("f{i}"), i, 0)).collect();
        let short = vec![CapturedFrame::with_vars("f5", vars(&[("a", json!(true))]))];
        assert_eq!(merge_captured_frames(&mut long_app, &short, false), 1);
        assert!(long_app[5].vars.is_some());
        assert!(long_app[..5].iter().all(|f| f.vars.is_none()));
    }

    #[test]
    fn test_merge_skips_out_of_app() {
        let mut app = vec![StackFrame::new("lib", 1, 1).with_in_app(false)];
        let captured = vec![CapturedFrame::with_vars("lib", vars(&[("a", json!(1))]))];

        assert_eq!(merge_captured_frames(&mut app, &captured, false), 0);
        assert!(app[0].vars.is_none());

        assert_eq!(merge_captured_frames(&mut app, &captured, true), 1);
        assert!(app[0].vars.is_some());
    }

    #[test]
    fn test_merge_anonymous_and_mismatch() {
        let mut app = vec![StackFrame::new("named", 1, 1), StackFrame::new("?", 2, 2)];
        let captured = vec![
            CapturedFrame::with_vars("", vars(&[("a", json!(1))])),
            CapturedFrame::with_vars("other", vars(&[("b", json!(2))])),
        ];

        assert_eq!(merge_captured_frames(&mut app, &captured, false), 1);
        assert!(app[1].vars.is_some());
        assert!(app[0].vars.is_none());
    }

    #[test]
    fn test_merge_ignores_promise_constructor() {
        let mut app = vec![
            StackFrame::new("outer", 1, 1),
            StackFrame::new("new Promise", 0, 0),
            StackFrame::new("inner", 2, 2),
        ];
        let captured = vec![
            CapturedFrame::with_vars("inner", vars(&[("i", json!(1))])),
            CapturedFrame::with_vars("outer", vars(&[("o", json!(2))])),
        ];

        assert_eq!(merge_captured_frames(&mut app, &captured, false), 2);
        assert!(app[0].vars.is_some());
        assert!(app[1].vars.is_none());
    }
}
