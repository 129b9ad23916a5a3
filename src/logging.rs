use color_eyre::{eyre::eyre, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// Logs go to stderr; with `logging.file` set they are also written to a daily
/// rolling file. The returned guard must live until exit so buffered lines flush.
pub fn init(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let env_filter = EnvFilter::builder()
    .with_default_directive(LevelFilter::from(logging.level).into())
    .from_env_lossy();

  let stderr_layer = fmt::layer()
    .compact()
    .with_target(false)
    .with_writer(std::io::stderr)
    .boxed();

  let (file_layer, guard) = if logging.file {
    let directory = match &logging.directory {
      Some(dir) => dir.clone(),
      None => dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
        .ok_or_else(|| eyre!("Could not determine data directory"))?
        .join("offcache")
        .join("logs"),
    };
    std::fs::create_dir_all(&directory)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

    let appender = tracing_appender::rolling::daily(&directory, "offcache.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
      .with_ansi(false)
      .with_target(true)
      .with_writer(writer)
      .boxed();
    (Some(layer), Some(guard))
  } else {
    (None, None)
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
