//! Thin layer over the `log` facade.
//!
//! The teacher crate's `LoggerLocal` owns where lines actually go (TTY,
//! file, voice alert) and gates each call against a configured level.
//! This crate is embedded in a host application that already owns its
//! own `log` subscriber, so `LogSink` only keeps the second half of
//! that job — level gating and prefixing — and leaves emission to
//! whatever `log::Log` implementation the host installed.

use crate::config::LogVerbosity;

/// Gates and prefixes log lines for one [`crate::Client`] instance.
///
/// Cloned freely; it is a handful of bytes behind an `Arc`-free plain
/// struct since `String`/`LogVerbosity` are cheap to copy around tasks.
#[derive(Debug, Clone)]
pub(crate) struct LogSink {
    verbosity: LogVerbosity,
    prefix: String,
}

impl LogSink {
    pub(crate) fn new(verbosity: LogVerbosity, prefix: impl Into<String>) -> Self {
        Self {
            verbosity,
            prefix: prefix.into(),
        }
    }

    fn enabled(&self, level: LogVerbosity) -> bool {
        level <= self.verbosity
    }

    fn line(&self, msg: &str) -> String {
        if self.prefix.is_empty() {
            msg.to_owned()
        } else {
            format!("{} {}", self.prefix, msg)
        }
    }

    pub(crate) fn debug(&self, msg: &str) {
        if self.enabled(LogVerbosity::Debug) {
            log::debug!("{}", self.line(msg));
        }
    }

    pub(crate) fn info(&self, msg: &str) {
        if self.enabled(LogVerbosity::Info) {
            log::info!("{}", self.line(msg));
        }
    }

    pub(crate) fn warn(&self, msg: &str) {
        if self.enabled(LogVerbosity::Warning) {
            log::warn!("{}", self.line(msg));
        }
    }

    pub(crate) fn error(&self, msg: &str) {
        if self.enabled(LogVerbosity::Error) {
            log::error!("{}", self.line(msg));
        }
    }

    /// Derives a sink with the same verbosity but a more specific
    /// prefix, e.g. appending an instance or server id.
    pub(crate) fn with_suffix(&self, suffix: impl std::fmt::Display) -> Self {
        let prefix = if self.prefix.is_empty() {
            format!("[{}]", suffix)
        } else {
            format!("{} [{}]", self.prefix, suffix)
        };
        Self {
            verbosity: self.verbosity,
            prefix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_disables_everything() {
        let sink = LogSink::new(LogVerbosity::Quiet, "");
        assert!(!sink.enabled(LogVerbosity::Error));
        assert!(!sink.enabled(LogVerbosity::Debug));
    }

    #[test]
    fn debug_enables_everything() {
        let sink = LogSink::new(LogVerbosity::Debug, "");
        assert!(sink.enabled(LogVerbosity::Error));
        assert!(sink.enabled(LogVerbosity::Debug));
    }

    #[test]
    fn suffix_nests_under_existing_prefix() {
        let sink = LogSink::new(LogVerbosity::Info, "[fleet]").with_suffix("instance-2");
        assert_eq!(sink.prefix, "[fleet] [instance-2]");
    }
}
