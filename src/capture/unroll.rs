//! Reading local scopes of a paused debuggee into plain JSON values.

use crate::error::Error;
use crate::frame::Variables;
use crate::session::{CallFrame, DebugSession, PropertyDescriptor, RemoteObject};
use crate::{muted_error, sw_warn};
use itertools::Itertools;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};

/// Frames (from the throw site outward) whose scopes are unrolled during a single pause.
pub const MAX_CAPTURED_FRAMES: usize = 5;
/// Properties read from a single scope or object.
pub const MAX_PROPERTIES: usize = 100;

/// `ClassName.method` when the receiver has a meaningful class, else the bare function name.
pub fn qualified_name(frame: &CallFrame) -> String {
    match frame.this.class_name.as_deref() {
        None | Some("") | Some("global") => frame.function_name.clone(),
        Some(class) => format!("{class}.{}", frame.function_name),
    }
}

enum Shape<'a> {
    Array(&'a str),
    Object(&'a str),
    Other,
}

fn shape(value: &RemoteObject) -> Shape<'_> {
    match (value.object_id.as_deref(), value.class_name.as_deref()) {
        (Some(id), Some("Array")) => Shape::Array(id),
        (Some(id), Some("Object")) => Shape::Object(id),
        _ => Shape::Other,
    }
}

/// Value of a non-container property.
///
/// Literal values are taken as is, `null` and `undefined` become `<null>` and `<undefined>`,
/// everything else that has a description is rendered as `<description>`. Functions are dropped.
pub fn render_value(value: &RemoteObject) -> Option<Value> {
    if let Some(literal) = &value.value {
        return Some(match literal {
            Value::Null => Value::String("<null>".to_string()),
            literal => literal.clone(),
        });
    }
    if value.ty == "undefined" {
        return Some(Value::String("<undefined>".to_string()));
    }
    match value.description.as_deref() {
        Some(description) if value.ty != "function" => {
            Some(Value::String(format!("<{description}>")))
        }
        _ => None,
    }
}

fn literal_of(prop: &PropertyDescriptor) -> Option<&Value> {
    prop.value.as_ref().and_then(|v| v.value.as_ref())
}

/// Array elements in index order. Inspector lists arrays as objects with numeric keys.
fn unroll_array(session: &dyn DebugSession, object_id: &str) -> Result<Value, Error> {
    let props = session.get_object_properties(object_id)?;
    let items = props
        .iter()
        .filter(|p| p.name != "length")
        .filter_map(|p| {
            let idx = p.name.parse::<u64>().ok()?;
            Some((idx, literal_of(p).cloned().unwrap_or(Value::Null)))
        })
        .take(MAX_PROPERTIES)
        .sorted_by_key(|(idx, _)| *idx)
        .map(|(_, v)| v)
        .collect();
    Ok(Value::Array(items))
}

/// Shallow object, fields keep the enumeration order of the inspector.
fn unroll_object(session: &dyn DebugSession, object_id: &str) -> Result<Value, Error> {
    let props = session.get_object_properties(object_id)?;
    let fields: serde_json::Map<String, Value> = props
        .iter()
        .take(MAX_PROPERTIES)
        .filter_map(|p| Some((p.name.clone(), literal_of(p)?.clone())))
        .collect();
    Ok(Value::Object(fields))
}

/// Read the variables of a local scope.
///
/// A property that fails to unroll is skipped, the rest of the scope is still read.
pub fn unroll_scope(session: &dyn DebugSession, scope_id: &str) -> Result<Variables, Error> {
    let props = session.get_object_properties(scope_id)?;
    let mut vars = Variables::new();

    for prop in props.iter().take(MAX_PROPERTIES) {
        let Some(value) = &prop.value else {
            continue;
        };
        let rendered = match shape(value) {
            Shape::Array(id) => muted_error!("local-variables", unroll_array(session, id)),
            Shape::Object(id) => muted_error!("local-variables", unroll_object(session, id)),
            Shape::Other => render_value(value),
        };
        if let Some(rendered) = rendered {
            vars.insert(prop.name.clone(), rendered);
        }
    }

    Ok(vars)
}

/// Calls the completion callback exactly once: either explicitly or on drop.
struct Completion<T, F: FnOnce(T)> {
    pending: Option<(T, F)>,
}

impl<T, F: FnOnce(T)> Completion<T, F> {
    fn value_mut(&mut self) -> Option<&mut T> {
        self.pending.as_mut().map(|(value, _)| value)
    }

    fn finish(&mut self) {
        if let Some((value, complete)) = self.pending.take() {
            complete(value);
        }
    }
}

impl<T, F: FnOnce(T)> Drop for Completion<T, F> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Run steps over an accumulator one after another, then hand the accumulator to `complete`.
///
/// A panicking step is logged and the sequence moves on. `complete` is called exactly once.
pub fn run_sequence<T, S, F>(init: T, steps: impl IntoIterator<Item = S>, complete: F)
where
    S: FnOnce(&mut T),
    F: FnOnce(T),
{
    let mut completion = Completion {
        pending: Some((init, complete)),
    };

    for (n, step) in steps.into_iter().enumerate() {
        let Some(acc) = completion.value_mut() else {
            break;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| step(acc))).is_err() {
            sw_warn!(target: "local-variables", "capture step {n} panicked, continue with the next one");
        }
    }

    completion.finish();
}
