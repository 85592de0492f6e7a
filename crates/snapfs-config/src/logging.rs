//! Structured logging utilities for snapfs components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use snapfs_config::log_block_debug;
//!
//! log_block_debug!("Preserved block", position = 3, pointer = 7);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const BLOCK: &'static str = "BLOCK";
    pub const LOCK: &'static str = "LOCK";
    pub const CHAIN: &'static str = "CHAIN";
    pub const OVERLAY: &'static str = "OVERLAY";
    pub const FUSE: &'static str = "FUSE";
    pub const CLI: &'static str = "CLI";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === BLOCK logging macros ===

#[macro_export]
macro_rules! log_block_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "BLOCK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_block_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "BLOCK", $($key = $value,)* $msg)
    };
}

// === LOCK logging macros ===

#[macro_export]
macro_rules! log_lock_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "LOCK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_lock_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "LOCK", $($key = $value,)* $msg)
    };
}

// === CHAIN logging macros ===

#[macro_export]
macro_rules! log_chain_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "CHAIN", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_chain_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CHAIN", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_chain_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CHAIN", $($key = $value,)* $msg)
    };
}

// === OVERLAY logging macros ===

#[macro_export]
macro_rules! log_overlay_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "OVERLAY", $($key = $value,)* $msg)
    };
}

// === FUSE logging macros ===

#[macro_export]
macro_rules! log_fuse_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "FUSE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_fuse_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "FUSE", $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CLI", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
///
/// `SNAPFS_LOG` wins over `RUST_LOG`; `level` applies when neither is set.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env("SNAPFS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::BLOCK, "BLOCK");
        assert_eq!(Component::CHAIN, "CHAIN");
        assert_eq!(Component::OVERLAY, "OVERLAY");
    }

    #[test]
    fn test_level_filters() {
        assert_eq!(LogLevel::Warn.as_filter(), "warn");
        assert_eq!(LogLevel::Trace.as_filter(), "trace");
    }
}
