//! Tracing subscriber setup for the service and the CLI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Output format of log lines.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
  /// Human readable, multi-field lines.
  #[default]
  Text,
  /// Abbreviated single lines.
  Compact,
  /// One JSON object per line.
  Json,
}

impl FromStr for LogFormat {
  type Err = String;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value.to_ascii_lowercase().as_str() {
      "text" => Ok(LogFormat::Text),
      "compact" => Ok(LogFormat::Compact),
      "json" => Ok(LogFormat::Json),
      other => Err(format!("unknown log format '{other}' (expected text, compact or json)")),
    }
  }
}

impl fmt::Display for LogFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      LogFormat::Text => "text",
      LogFormat::Compact => "compact",
      LogFormat::Json => "json",
    })
  }
}

/// Parses a level name; unknown names fall back to `info`.
pub fn parse_level(level: &str) -> LevelFilter {
  match level.to_lowercase().as_str() {
    "off" => LevelFilter::OFF,
    "error" => LevelFilter::ERROR,
    "warn" => LevelFilter::WARN,
    "debug" => LevelFilter::DEBUG,
    "trace" => LevelFilter::TRACE,
    _ => LevelFilter::INFO,
  }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` overrides `level`. When `file` is given, logs are written to it
/// without colours through a non-blocking writer; the returned guard must be
/// kept alive for the lifetime of the program so buffered lines are flushed.
pub fn init_logging(level: &str, format: LogFormat, file: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::builder()
    .with_default_directive(parse_level(level).into())
    .from_env_lossy();

  let (writer, guard) = match file {
    Some(path) => {
      let directory = path.parent().filter(|dir| !dir.as_os_str().is_empty());
      let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tributary.log".to_string());
      let directory = directory.unwrap_or_else(|| Path::new("."));
      if std::fs::create_dir_all(directory).is_err() {
        eprintln!("cannot create log directory {}, logging to stderr", directory.display());
        tracing_appender::non_blocking(std::io::stderr())
      } else {
        tracing_appender::non_blocking(tracing_appender::rolling::never(directory, name))
      }
    }
    None => tracing_appender::non_blocking(std::io::stderr()),
  };
  let ansi = file.is_none();

  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .with_ansi(ansi)
    .with_writer(writer);
  let installed = match format {
    LogFormat::Text => builder.try_init(),
    LogFormat::Compact => builder.compact().try_init(),
    LogFormat::Json => builder.json().try_init(),
  };
  // A subscriber may already be installed, e.g. by a test harness.
  installed.ok().map(|()| guard)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_level() {
    assert_eq!(parse_level("DEBUG"), LevelFilter::DEBUG);
    assert_eq!(parse_level("error"), LevelFilter::ERROR);
    assert_eq!(parse_level("verbose"), LevelFilter::INFO);
  }

  #[test]
  fn test_off_disables_logging() {
    assert_eq!(parse_level("off"), LevelFilter::OFF);
    assert_eq!(parse_level("OFF").into_level(), None);
  }

  #[test]
  fn test_log_format_names() {
    assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
    assert_eq!(LogFormat::Compact.to_string(), "compact");
    assert!("xml".parse::<LogFormat>().is_err());
  }
}
