#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- debug channel errors --------------------------------------
    #[error("debug channel unavailable: {0}")]
    Connection(String),
    #[error("debug session is not connected")]
    NotConnected,
    #[error("debugger already paused")]
    AlreadyPaused,
    #[error("capture: {0}")]
    Capture(String),
    #[error("inspector protocol: {0}")]
    Protocol(String),

    // --------------------------------- worker errors ---------------------------------------------
    #[error("watchdog worker: {0}")]
    WorkerLifecycle(String),

    // --------------------------------- configuration errors --------------------------------------
    #[error("invalid option `{field}`: {reason}")]
    Configuration { field: &'static str, reason: String },

    // --------------------------------- outbound errors -------------------------------------------
    #[error("report transport: {0}")]
    Transport(String),

    // --------------------------------- third party errors ----------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Return a hint to a host: continue after error or stop whole process.
    /// This crate is additive diagnostics, nothing here may take the host down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Connection(_) => false,
            Error::NotConnected => false,
            Error::AlreadyPaused => false,
            Error::Capture(_) => false,
            Error::Protocol(_) => false,
            Error::WorkerLifecycle(_) => false,
            Error::Configuration { .. } => false,
            Error::Transport(_) => false,
            Error::IO(_) => false,
            Error::Json(_) => false,
            Error::Toml(_) => false,
        }
    }

    /// True if the whole subsystem should switch itself off after this error.
    pub fn disables_subsystem(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::WorkerLifecycle(_))
    }
}

/// WebSocket failures of the inspector channel.
impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Io(e) => Error::IO(e),
            tungstenite::Error::Capacity(e) => Error::Protocol(format!("message rejected: {e}")),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Error::Protocol("connection closed".to_string())
            }
            other => Error::Protocol(other.to_string()),
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $target: expr, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: $target, "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $target: expr, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: $target, concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($target: expr, $res: expr) => {
        $crate::_error!($crate::sw_warn, $target, $res)
    };
    ($target: expr, $res: expr, $msg: tt) => {
        $crate::_error!($crate::sw_warn, $target, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($target: expr, $res: expr) => {
        $crate::_error!($crate::sw_debug, $target, $res)
    };
    ($target: expr, $res: expr, $msg: tt) => {
        $crate::_error!($crate::sw_debug, $target, $res, $msg)
    };
}
