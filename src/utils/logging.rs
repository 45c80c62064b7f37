//! Conditional logging macros gated on a module-level `ENABLE_LOGS` const.
//!
//! A module that wants tick-rate logging defines `const ENABLE_LOGS: bool`
//! and pulls the macros in from the crate root; flipping the const silences
//! the module without touching call sites.

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
