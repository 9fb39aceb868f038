use std::error::Error;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. With `config.file` set, output goes
/// to a daily-rolling file through a non-blocking writer; keep the returned guard alive
/// until shutdown so buffered lines are flushed. Otherwise logs go to stderr.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>, Box<dyn Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    let (writer, guard) = match &config.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let prefix = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "llm-session.log".to_string());
            let file_appender = tracing_appender::rolling::daily(directory, prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        // Disable ANSI colors for cleaner log files
        .with_ansi(config.file.is_none())
        .with_line_number(true)
        .with_file(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false);

    if config.json {
        builder.json().try_init()?;
    } else {
        builder.try_init()?;
    }

    Ok(guard)
}
