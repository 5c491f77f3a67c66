use crate::error::Error;
use crate::{muted_error, sw_warn, weak_error};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::read_to_string;
use std::path::Path;
use std::time::Duration;

/// Primitive value of a static tag.
#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&TagValue> for serde_json::Value {
    fn from(tag: &TagValue) -> Self {
        match tag {
            TagValue::Bool(b) => serde_json::Value::Bool(*b),
            TagValue::Int(i) => serde_json::Value::from(*i),
            TagValue::Float(f) => serde_json::Value::from(*f),
            TagValue::Str(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Agent options. Every field has a default, so a partial (or empty) config file is valid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Enable log output of the agent itself.
    pub debug: bool,
    /// Interval between two heartbeats of the host main loop.
    pub poll_interval_ms: u64,
    /// Host is considered hung if no heartbeat arrives within this time.
    pub anr_threshold_ms: u64,
    /// Max number of hang reports per process lifetime.
    pub max_anr_events: u32,
    /// Pause the debugger to capture a hung stack.
    pub capture_stack_trace: bool,
    /// Capture local variables for caught exceptions too, not only uncaught ones.
    pub capture_all_exceptions: bool,
    /// Rate limit for "capture all" mode.
    pub max_exceptions_per_second: u32,
    /// Allow merging variables onto library frames.
    pub include_out_of_app_frames: bool,
    /// Prefix stripped from file names when module names are resolved.
    pub app_root_path: Option<String>,
    /// Tags attached to every hang report.
    pub static_tags: BTreeMap<String, TagValue>,
    pub release: Option<String>,
    pub environment: Option<String>,
    pub dist: Option<String>,
    /// Where hang reports go, see [`crate::transport::Endpoint`].
    pub endpoint: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            debug: false,
            poll_interval_ms: 50,
            anr_threshold_ms: 5000,
            max_anr_events: 1,
            capture_stack_trace: true,
            capture_all_exceptions: true,
            max_exceptions_per_second: 50,
            include_out_of_app_frames: false,
            app_root_path: None,
            static_tags: BTreeMap::new(),
            release: None,
            environment: None,
            dist: None,
            endpoint: "stderr".to_string(),
        }
    }
}

impl Options {
    const DEFAULT_PATH: &'static str = ".config/stallwatch/config.toml";

    pub fn from_toml_str(data: &str) -> Result<Self, Error> {
        Ok(toml::de::from_str(data)?)
    }

    /// Load options from file. Any error is reported as a warning and defaults are returned.
    ///
    /// # Arguments
    ///
    /// * `path`: config file path, if `None` then `~/.config/stallwatch/config.toml` is used
    pub fn from_file(path: Option<&Path>) -> Self {
        let data = match path {
            None => {
                let Some(home) = home::home_dir() else {
                    return Self::default();
                };
                match muted_error!("agent", read_to_string(home.join(Self::DEFAULT_PATH))) {
                    Some(data) => data,
                    None => return Self::default(),
                }
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    sw_warn!(target: "agent", "error while load config file {}: {err}", path.display());
                    return Self::default();
                }
            },
        };

        weak_error!("agent", Self::from_toml_str(&data), "invalid config, defaults used:")
            .unwrap_or_default()
    }

    /// Return a list of problems with the current options.
    pub fn validate(&self) -> Vec<Error> {
        let mut problems = vec![];
        if self.poll_interval_ms == 0 {
            problems.push(Error::Configuration {
                field: "poll_interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.anr_threshold_ms == 0 {
            problems.push(Error::Configuration {
                field: "anr_threshold_ms",
                reason: "must be positive".to_string(),
            });
        } else if self.poll_interval_ms >= self.anr_threshold_ms {
            problems.push(Error::Configuration {
                field: "poll_interval_ms",
                reason: format!(
                    "{} ms is not below the hang threshold ({} ms)",
                    self.poll_interval_ms, self.anr_threshold_ms
                ),
            });
        }
        if self.max_exceptions_per_second == 0 {
            problems.push(Error::Configuration {
                field: "max_exceptions_per_second",
                reason: "must be positive".to_string(),
            });
        }
        problems
    }

    /// Return options where every invalid value is replaced by its default.
    /// Each replacement is logged once as a warning.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        for problem in self.validate() {
            sw_warn!(target: "agent", "{problem}, default used");
            match &problem {
                Error::Configuration {
                    field: "poll_interval_ms",
                    ..
                } => self.poll_interval_ms = defaults.poll_interval_ms,
                Error::Configuration {
                    field: "anr_threshold_ms",
                    ..
                } => self.anr_threshold_ms = defaults.anr_threshold_ms,
                Error::Configuration {
                    field: "max_exceptions_per_second",
                    ..
                } => self.max_exceptions_per_second = defaults.max_exceptions_per_second,
                _ => {}
            }
        }

        if !self.validate().is_empty() {
            // a user threshold below the default poll interval, fall back to both defaults
            self.poll_interval_ms = defaults.poll_interval_ms;
            self.anr_threshold_ms = defaults.anr_threshold_ms;
        }
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn anr_threshold(&self) -> Duration {
        Duration::from_millis(self.anr_threshold_ms)
    }
}
