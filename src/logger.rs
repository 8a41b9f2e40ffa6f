//! Logger capability handed to providers and components.
//!
//! The dependency manager always holds a `logger:default` singleton. Unless a
//! configuration registers its own `logger` provider, that singleton is a
//! [`TracingLogger`] forwarding to the `tracing` subscriber installed by the
//! binary.

use std::fmt;
use std::sync::Arc;

use tracing::Level;

/// Sink for component log lines.
pub trait Logger: Send + Sync {
    /// Emit a message at the given level.
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::DEBUG, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::INFO, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::WARN, message);
    }

    fn error(&self, message: &str) {
        self.log(Level::ERROR, message);
    }
}

impl fmt::Debug for dyn Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Logger")
    }
}

/// Logger backed by `tracing` events.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    component: String,
}

impl TracingLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Returns the component label attached to every event.
    pub fn component(&self) -> &str {
        &self.component
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new("kued")
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        let component = self.component.as_str();
        match level {
            Level::ERROR => tracing::error!(component, "{}", message),
            Level::WARN => tracing::warn!(component, "{}", message),
            Level::INFO => tracing::info!(component, "{}", message),
            Level::DEBUG => tracing::debug!(component, "{}", message),
            Level::TRACE => tracing::trace!(component, "{}", message),
        }
    }
}

/// Shared handle to the default logger.
pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger::default())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Logger that records every line for assertions.
    #[derive(Default)]
    pub struct RecordingLogger {
        pub lines: Mutex<Vec<(Level, String)>>,
    }

    impl RecordingLogger {
        pub fn contains(&self, level: Level, needle: &str) -> bool {
            self.lines
                .lock()
                .expect("lock not poisoned")
                .iter()
                .any(|(l, line)| *l == level && line.contains(needle))
        }
    }

    impl Logger for RecordingLogger {
        fn log(&self, level: Level, message: &str) {
            self.lines
                .lock()
                .expect("lock not poisoned")
                .push((level, message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingLogger;
    use super::*;

    #[test]
    fn test_default_component_label() {
        let logger = TracingLogger::default();
        assert_eq!(logger.component(), "kued");
    }

    #[test]
    fn test_helpers_route_to_levels() {
        let logger = RecordingLogger::default();
        logger.warn("careful");
        logger.error("broken");

        assert!(logger.contains(Level::WARN, "careful"));
        assert!(logger.contains(Level::ERROR, "broken"));
        assert!(!logger.contains(Level::INFO, "careful"));
    }
}
