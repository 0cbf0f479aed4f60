//! Logging and tracing initialization for cloudmig.
//!
//! Console output is either human-readable or JSON. Optionally every event is
//! also appended, without ANSI colours, to a log file so that a long migration
//! leaves a trail behind after the terminal is gone.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{
        self,
        format::{DefaultFields, Format, FmtSpan},
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Configuration for the logging system.
#[derive(Debug, Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
    /// Append a plain-text copy of every event to this file
    pub file: Option<PathBuf>,
}

/// Initialize the tracing subscriber.
///
/// Call once, early in `main`, after the configuration is known. `RUST_LOG`
/// overrides the default `cloudmig=<level>` filter.
pub fn init(config: LogConfig) -> io::Result<()> {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "cloudmig={}",
            default_level.as_str().to_lowercase()
        ))
    });

    let log_file = match &config.file {
        Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
        None => None,
    };

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .with(log_file.map(plain_file_layer))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(log_file.map(plain_file_layer))
            .init();
    }

    Ok(())
}

fn plain_file_layer<S>(file: File) -> fmt::Layer<S, DefaultFields, Format, Mutex<File>>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file))
}

/// Rate limiter for repetitive progress messages, such as "still enumerating".
///
/// The orchestrator is the only writer, so this needs `&mut self` rather than
/// atomics.
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True on the first call and then at most once per interval.
    pub fn should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Allow the next call to log immediately.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_allows_first_log() {
        let mut throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_blocks_immediate_second_log() {
        let mut throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn throttle_reset_allows_log() {
        let mut throttle = LogThrottle::new(Duration::from_secs(100));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        throttle.reset();
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_zero_interval_always_logs() {
        let mut throttle = LogThrottle::new(Duration::ZERO);
        assert!(throttle.should_log());
        assert!(throttle.should_log());
    }
}
