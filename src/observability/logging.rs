//! Logging setup: stdout by default, optional non-blocking rolling file
//! output.

use tracing::{Level, Subscriber};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_log::LogTracer;
use tracing_subscriber::{
    fmt::{time::ChronoUtc, writer::BoxMakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DEFAULT_LOG_TARGET: &str = "mcp_completions_gateway";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub json_format: bool,
    pub log_dir: Option<String>,
    pub colorize: bool,
    pub log_file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            log_dir: None,
            colorize: true,
            log_file_name: "mcp-gateway.log".to_string(),
        }
    }
}

/// Guard that keeps the file appender thread alive.
#[allow(dead_code)]
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// One formatted output layer over an arbitrary writer; stdout and the file
/// appender differ only in writer and ansi-coloring.
fn fmt_layer<S>(writer: BoxMakeWriter, ansi: bool, json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::new(TIME_FORMAT.to_string()));

    if json {
        layer.json().flatten_event(true).boxed()
    } else {
        layer.boxed()
    }
}

pub fn init_logging(config: LoggingConfig) -> LogGuard {
    let _ = LogTracer::init();

    // RUST_LOG wins; otherwise only this crate logs, at the configured
    // level.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{}={}", DEFAULT_LOG_TARGET, config.level))
    });

    let mut layers = vec![fmt_layer(
        BoxMakeWriter::new(std::io::stdout),
        config.colorize,
        config.json_format,
    )];

    let mut file_guard = None;
    if let Some(log_dir) = &config.log_dir {
        match std::fs::create_dir_all(log_dir) {
            Ok(()) => {
                let appender = rolling::daily(log_dir, &config.log_file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                file_guard = Some(guard);
                layers.push(fmt_layer(
                    BoxMakeWriter::new(writer),
                    false,
                    config.json_format,
                ));
            }
            Err(e) => {
                eprintln!("Failed to create log directory {}: {}", log_dir, e);
            }
        }
    }

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init();

    LogGuard {
        _file_guard: file_guard,
    }
}
