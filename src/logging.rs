/*!
 * Diagnostic logging
 *
 * Logs never share stdout with transfer results. Where they go follows the
 * configuration:
 *
 * - `log_file` set: JSON lines appended to that file
 * - `--json`: JSON lines on stderr, next to the JSON results on stdout
 * - otherwise: compact lines on stderr
 *
 * `RUST_LOG` overrides the level entirely. Without it the configured level
 * applies to ferry's own crates, and `--quiet` caps it at warnings.
 */

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::{Layered, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::FerryConfig;
use crate::error::{FerryError, Result};

/// Crates whose events pass the default filter
const LOG_TARGETS: &[&str] = &["ferry", "ferry_core_resilience"];

/// Destination for log events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stderr,
    StderrJson,
    File(PathBuf),
}

impl LogSink {
    pub fn for_config(config: &FerryConfig) -> Self {
        match &config.log_file {
            Some(path) => LogSink::File(path.clone()),
            None if config.json => LogSink::StderrJson,
            None => LogSink::Stderr,
        }
    }
}

/// Level used when `RUST_LOG` is unset
pub fn effective_level(config: &FerryConfig) -> Level {
    let level = config.log_level.to_tracing_level();
    if config.quiet {
        // More verbose levels compare greater
        level.min(Level::WARN)
    } else {
        level
    }
}

fn directive(level: Level) -> String {
    let level = level.to_string().to_lowercase();
    LOG_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

fn env_filter(level: Level) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive(level)))
        .map_err(|e| FerryError::Config(format!("Failed to create log filter: {}", e)))
}

fn sink_layer<S>(sink: &LogSink) -> Result<Box<dyn Layer<S> + Send + Sync>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = match sink {
        LogSink::Stderr => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .boxed(),
        LogSink::StderrJson => fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .boxed(),
        LogSink::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    FerryError::Config(format!(
                        "Failed to open log file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_thread_ids(true)
                .with_span_events(FmtSpan::CLOSE)
                .json()
                .boxed()
        }
    };
    Ok(layer)
}

/// Install the global subscriber for `config`
pub fn init_logging(config: &FerryConfig) -> Result<()> {
    let filter = env_filter(effective_level(config))?;
    let layer = sink_layer::<Layered<EnvFilter, Registry>>(&LogSink::for_config(config))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| FerryError::Config(format!("Failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use serde_json::Value;

    #[test]
    fn test_sink_follows_config() {
        let mut config = FerryConfig::default();
        assert_eq!(LogSink::for_config(&config), LogSink::Stderr);

        config.json = true;
        assert_eq!(LogSink::for_config(&config), LogSink::StderrJson);

        config.log_file = Some(PathBuf::from("/var/log/ferry.log"));
        assert_eq!(
            LogSink::for_config(&config),
            LogSink::File(PathBuf::from("/var/log/ferry.log"))
        );
    }

    #[test]
    fn test_quiet_caps_level_at_warn() {
        let mut config = FerryConfig {
            log_level: LogLevel::Debug,
            ..Default::default()
        };
        assert_eq!(effective_level(&config), Level::DEBUG);

        config.quiet = true;
        assert_eq!(effective_level(&config), Level::WARN);

        config.log_level = LogLevel::Error;
        assert_eq!(effective_level(&config), Level::ERROR);
    }

    #[test]
    fn test_directive_covers_workspace_crates() {
        let directive = directive(Level::INFO);
        assert_eq!(directive, "ferry=info,ferry_core_resilience=info");
        assert!(EnvFilter::try_new(directive).is_ok());
    }

    #[test]
    fn test_file_sink_appends_filtered_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.log");
        std::fs::write(&path, "earlier run\n").unwrap();

        let layer = sink_layer::<Layered<EnvFilter, Registry>>(&LogSink::File(path.clone())).unwrap();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new(directive(Level::INFO)))
            .with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "ferry::copy", "session saved");
            tracing::debug!(target: "ferry::copy", "marker moved");
            tracing::warn!(target: "other_crate", "not ours");
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("earlier run"));
        let events: Vec<Value> = lines.map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["level"], "INFO");
        assert_eq!(events[0]["fields"]["message"], "session saved");
    }

    #[test]
    fn test_unwritable_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no/such/dir/ferry.log");
        let result = sink_layer::<Registry>(&LogSink::File(missing));
        assert!(matches!(result, Err(FerryError::Config(_))));
    }
}
