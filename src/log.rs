use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

#[doc(hidden)]
pub use ::log as __log;

static ENABLED: AtomicBool = AtomicBool::new(false);
static INIT: Once = Once::new();

#[inline(always)]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

pub fn disable() {
    ENABLED.store(false, Ordering::SeqCst)
}

pub fn enable() {
    ENABLED.store(true, Ordering::SeqCst)
}

/// Install `env_logger` as the global logger (filter taken from `RUST_LOG`).
///
/// Safe to call many times; if the host already installed its own logger this is a no-op.
pub fn init() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_default_env().try_init();
    });
}

/// Forward to `log::log!` while agent logging is switched on, a host that never enabled
/// it pays one atomic load per call.
#[doc(hidden)]
#[macro_export]
macro_rules! __sw_log {
    (target: $target:expr, $level:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            $crate::log::__log::log!(target: $target, $level, $($arg)+)
        }
    };
    ($level:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            $crate::log::__log::log!($level, $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! sw_error {
    (target: $target:expr, $($arg:tt)+) => {
        $crate::__sw_log!(target: $target, $crate::log::__log::Level::Error, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__sw_log!($crate::log::__log::Level::Error, $($arg)+)
    };
}

#[macro_export]
macro_rules! sw_warn {
    (target: $target:expr, $($arg:tt)+) => {
        $crate::__sw_log!(target: $target, $crate::log::__log::Level::Warn, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__sw_log!($crate::log::__log::Level::Warn, $($arg)+)
    };
}

#[macro_export]
macro_rules! sw_info {
    (target: $target:expr, $($arg:tt)+) => {
        $crate::__sw_log!(target: $target, $crate::log::__log::Level::Info, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__sw_log!($crate::log::__log::Level::Info, $($arg)+)
    };
}

#[macro_export]
macro_rules! sw_debug {
    (target: $target:expr, $($arg:tt)+) => {
        $crate::__sw_log!(target: $target, $crate::log::__log::Level::Debug, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__sw_log!($crate::log::__log::Level::Debug, $($arg)+)
    };
}

#[cfg(test)]
mod test {
    #[test]
    fn test_switch() {
        super::enable();
        assert!(super::is_enabled());
        crate::sw_debug!(target: "log-test", "value {}", 1);
        crate::sw_info!("plain {}", 2);
        super::disable();
        assert!(!super::is_enabled());
    }
}
