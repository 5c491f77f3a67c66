use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Captured local variables of a single frame, in the enumeration order of the inspector.
pub type Variables = IndexMap<String, serde_json::Value>;

/// Application-level stack frame, as produced by parsing an exception's stack text.
///
/// Frame lists of this type are stored in SDK order: outermost call first, throw site last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_app: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<Variables>,
}

impl StackFrame {
    pub fn new(function: impl Into<String>, lineno: u32, colno: u32) -> Self {
        Self {
            function: Some(function.into()),
            lineno: Some(lineno),
            colno: Some(colno),
            ..Default::default()
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_in_app(mut self, in_app: bool) -> Self {
        self.in_app = Some(in_app);
        self
    }
}

/// A stack frame as seen through the debugger at pause time.
///
/// Lists of captured frames are in debugger call order: innermost (throw site) first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapturedFrame {
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<Variables>,
}

impl CapturedFrame {
    /// Frame without accessible local scope, keeps positional alignment only.
    pub fn bare(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            vars: None,
        }
    }

    pub fn with_vars(function: impl Into<String>, vars: Variables) -> Self {
        Self {
            function: function.into(),
            vars: Some(vars),
        }
    }
}
