//! Logging setup for the `migrate` binary
//!
//! Logs go to stderr so that `status --json` output on stdout stays parseable.

use std::io;

use clap::ValueEnum;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log line format selected with `--log-format`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration for the CLI
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn")
    pub level: String,
    /// Enable JSON structured logging (vs plain text)
    pub json_format: bool,
    /// Include file and line number information
    pub include_location: bool,
    /// Environment filter (supports complex filters like "migrate_orm=debug,sqlx=warn")
    pub env_filter: Option<String>,
}

impl LoggingConfig {
    /// Configuration derived from `--log-format` and the `-v` count
    pub fn for_cli(format: LogFormat, verbosity: u8) -> Self {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };

        Self {
            level: level.to_string(),
            json_format: format == LogFormat::Json,
            include_location: verbosity > 1,
            // sqlx logs every statement at info; keep it quiet unless asked.
            env_filter: Some(format!("{level},sqlx=warn")),
        }
    }
}

/// Initialize logging; `RUST_LOG` wins over the configured filter
pub fn init_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let env_filter = config.env_filter.as_deref().unwrap_or(&config.level);
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(env_filter))?;

    let layer = Layer::new()
        .with_writer(io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()?;
    }

    tracing::debug!(
        target: "migrate::logging",
        "Logging initialized (level: {}, format: {})",
        config.level,
        if config.json_format { "JSON" } else { "text" }
    );

    Ok(())
}
