//! Logging infrastructure - structured tracing for storage and root passes
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable level through `LogConfig` or `VM_ROOTS_LOG_*` variables
//! - Zero-cost when disabled
//! - Per-subsystem targets: `storage`, `local_refs`, `roots`
//! - Optional file output through a non-blocking appender

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

// Re-export tracing macros for use throughout the crate
pub use tracing::{debug, error, info, trace, warn, Level};

use crate::reference::ObjectType;
use crate::roots::RootType;

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Keeps the file appender's worker alive for the life of the process
static FILE_GUARD: Mutex<Option<WorkerGuard>> = parking_lot::const_mutex(None);

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    /// Also write to this file (in addition to stderr)
    pub log_path: Option<String>,
    pub json_format: bool,
    /// Emit span enter/close events (root passes run inside spans)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // VM_ROOTS_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("VM_ROOTS_LOG_LEVEL") {
            config.level = parse_level(&level_str).unwrap_or(Level::INFO);
        }

        if let Ok(path) = std::env::var("VM_ROOTS_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("VM_ROOTS_LOG_JSON").is_ok();
        config.show_spans = std::env::var("VM_ROOTS_LOG_SPANS").is_ok();

        config
    }

    /// Verbose config for debugging reference leaks
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: None,
            json_format: false,
            show_spans: true,
        }
    }
}

/// Parse a level name as used in config files and environment variables
pub fn parse_level(name: &str) -> Option<Level> {
    match name.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration (idempotent)
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("vm_roots={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let (json_layer, compact_layer) = if config.json_format {
            let layer = fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_span_events(span_events.clone())
                .with_target(true);
            (Some(layer), None)
        } else {
            let layer = fmt::layer()
                .compact()
                .with_writer(io::stderr)
                .with_span_events(span_events.clone())
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions));
            (None, Some(layer))
        };

        let file_layer = config.log_path.as_deref().map(|path| {
            let path = Path::new(path);
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "vm-roots.log".to_string());

            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            *FILE_GUARD.lock() = Some(guard);

            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_span_events(span_events.clone())
        });

        // Another subscriber may already be installed (tests, embedding VM)
        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .with(compact_layer)
            .with(file_layer)
            .try_init()
            .ok();
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Storage and root logging helpers
// ============================================================================

/// Log a table or local-frame budget running out
#[inline]
pub fn log_storage_exhausted(kind: ObjectType, capacity: usize) {
    error!(
        target: "storage",
        event = "storage_exhausted",
        kind = %kind,
        capacity,
        "reference storage exhausted"
    );
}

/// Log a table entering its near-capacity margin
#[inline]
pub fn log_near_capacity(kind: ObjectType, len: usize, max_size: usize) {
    warn!(
        target: "storage",
        event = "near_capacity",
        kind = %kind,
        len,
        max_size,
        "reference storage close to its limit"
    );
}

/// Log one entry of a diagnostic dump
#[inline]
pub fn log_dump_entry(kind: ObjectType, position: usize, class_name: &str) {
    warn!(
        target: "storage",
        event = "dump_entry",
        kind = %kind,
        position,
        class = class_name,
        "live reference"
    );
}

/// Log use of a reference that is not live
#[inline]
pub fn log_invalid_ref(operation: &str, reference: &dyn std::fmt::Debug) {
    warn!(
        target: "storage",
        event = "invalid_ref",
        operation,
        reference = ?reference,
        "operation on invalid reference ignored"
    );
}

/// Log completion of one root category
#[inline]
pub fn log_roots_visited(root_type: RootType, count: usize) {
    debug!(
        target: "roots",
        event = "roots_visited",
        root_type = %root_type,
        count,
        "root category visited"
    );
}

/// Log completion of one moved-reference update step
#[inline]
pub fn log_refs_updated(step: &str, updated: usize) {
    debug!(
        target: "roots",
        event = "refs_updated",
        step,
        updated,
        "moved references updated"
    );
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            let elapsed = self.start.elapsed();
            debug!(
                target: "roots",
                operation = self.operation,
                duration_us = elapsed.as_micros() as u64,
                "operation completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(config.log_path.is_none());

        let debug_config = LogConfig::debug();
        assert_eq!(debug_config.level, Level::TRACE);
        assert!(debug_config.show_spans);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARN"), Some(Level::WARN));
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_init_idempotent() {
        init();
        init();
        assert!(is_initialized());
    }

    #[test]
    fn test_helpers_do_not_panic() {
        log_storage_exhausted(ObjectType::Global, 16);
        log_near_capacity(ObjectType::Weak, 14, 16);
        log_dump_entry(ObjectType::Local, 0, "std.core.Object");
        log_roots_visited(RootType::Frame, 3);
        log_refs_updated("thread_locals", 2);
        let _guard = perf::track("test");
    }
}
