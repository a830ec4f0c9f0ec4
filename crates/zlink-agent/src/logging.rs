//! Tracing subscriber setup.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSection;

/// Install the global subscriber.
///
/// `RUST_LOG` (already folded into `config.level` by the config loader)
/// takes precedence over `override_level`. The returned guard must live as
/// long as the process or buffered file output is lost.
pub fn init(config: &LoggingSection, override_level: Option<&str>) -> anyhow::Result<Option<WorkerGuard>> {
    let level = match override_level {
        Some(level) if std::env::var_os("RUST_LOG").is_none() => level,
        _ => config.level.as_str(),
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(rolling_writer(path));
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let json_layer = config.json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!config.json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}

fn rolling_writer(path: &Path) -> tracing_appender::rolling::RollingFileAppender {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let prefix = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "zlink-agent.log".to_string());
    tracing_appender::rolling::daily(dir, prefix)
}
