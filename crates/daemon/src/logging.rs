//! Tracing setup
//!
//! `RUST_LOG` overrides the default `bulwark=info` filter. With a log
//! directory configured, a daily-rolling JSON file is written next to the
//! console output.

use crate::settings::{LogFormat, Settings};
use anyhow::Result;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "bulwark.log";

/// Install the global subscriber
///
/// Keep the returned guard alive for the life of the process, dropping it
/// flushes the file writer.
pub fn init(settings: &Settings) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("bulwark=info"))?;

    let (file_writer, guard) = match &settings.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    match settings.log_format {
        LogFormat::Json => {
            // Production: JSON structured logging
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .with(file_layer(file_writer))
                .try_init()?;
        }
        LogFormat::Pretty => {
            // Development: pretty formatting with colors
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .with(file_layer(file_writer))
                .try_init()?;
        }
    }

    Ok(guard)
}

fn file_layer<S>(writer: Option<NonBlocking>) -> Option<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    writer.map(|writer| fmt::layer().json().with_ansi(false).with_writer(writer))
}
