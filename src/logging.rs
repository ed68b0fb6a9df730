// Logging module, powered by tracing-subscriber
//
// Library crates log through the `log` facade; `tracing_log::LogTracer`
// routes those records into the subscriber installed here.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingSettings;

/// Log format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// timestamp LEVEL target - message
    Compact,
    /// JSON lines
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" | "jsonl" => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Base level, noisy-crate overrides, then per-target overrides from config
fn build_env_filter(
    level: &str,
    target_levels: &HashMap<String, String>,
) -> anyhow::Result<EnvFilter> {
    let mut directives = vec![level.to_string()];

    let noisy: &[(&str, &str)] = &[
        ("openraft", "error"),
        ("h2", "warn"),
        ("tower", "warn"),
        ("hyper", "warn"),
        ("actix_server", "warn"),
        ("actix_web", "warn"),
    ];
    for (target, lvl) in noisy {
        directives.push(format!("{}={}", target, lvl));
    }

    for (target, lvl) in target_levels {
        directives.push(format!("{}={}", target, lvl));
    }

    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{}': {}", filter_str, e))
}

/// Install the global subscriber: an optional console layer plus an
/// optional file layer, both in the configured format.
pub fn init_logging(settings: &LoggingSettings) -> anyhow::Result<()> {
    let format = LogFormat::parse(&settings.format);

    tracing_log::LogTracer::init().ok();

    let console_layer = if settings.log_to_console {
        let filter = build_env_filter(&settings.level, &settings.targets)?;
        let layer = match format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_thread_names(true)
                .with_filter(filter)
                .boxed(),
            LogFormat::Compact => tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true)
                .with_target(true)
                .with_filter(filter)
                .boxed(),
        };
        Some(layer)
    } else {
        None
    };

    let file_layer = match &settings.file_path {
        Some(file_path) => {
            if let Some(parent) = Path::new(file_path).parent() {
                fs::create_dir_all(parent)?;
            }
            let log_file = OpenOptions::new().create(true).append(true).open(file_path)?;
            let filter = build_env_filter(&settings.level, &settings.targets)?;
            let layer = match format {
                LogFormat::Json => tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(log_file)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_filter(filter)
                    .boxed(),
                LogFormat::Compact => tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(log_file)
                    .with_target(true)
                    .with_filter(filter)
                    .boxed(),
            };
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::trace!(
        "Logging initialized: level={}, format={:?}, file={:?}",
        settings.level,
        format,
        settings.file_path
    );
    Ok(())
}
