//! Service configuration.
//!
//! Loaded from a TOML file, every field optional:
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 1234
//! folder = "./running_pipelines"
//! plugins = ["./plugins"]
//! log_level = "info"     # off, error, warn, info, debug, trace
//! log_format = "text"    # text, compact, json
//! log_file = "./tributary.log"
//! ```

use crate::error::PipelineError;
use crate::logging::LogFormat;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Settings of the pipeline service.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
  /// Address to bind (default: 127.0.0.1).
  pub host: String,
  /// Port to bind (default: 1234).
  pub port: u16,
  /// Base folder for pipeline artifacts (default: ./running_pipelines).
  pub folder: PathBuf,
  /// Plugin roots searched for every pipeline.
  pub plugins: Vec<PathBuf>,
  /// Log level, overridden by `RUST_LOG` (default: info).
  pub log_level: String,
  /// Console log format (default: text).
  pub log_format: LogFormat,
  /// Optional log file; logs go to the console when absent.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub log_file: Option<PathBuf>,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      host: "127.0.0.1".to_string(),
      port: 1234,
      folder: PathBuf::from("./running_pipelines"),
      plugins: Vec::new(),
      log_level: "info".to_string(),
      log_format: LogFormat::Text,
      log_file: None,
    }
  }
}

impl ServiceConfig {
  /// Parses TOML text.
  pub fn from_toml(text: &str) -> Result<Self, PipelineError> {
    toml::from_str(text).map_err(|err| PipelineError::configuration("service configuration", err.to_string()))
  }

  /// Reads a TOML file.
  pub fn load(path: &Path) -> Result<Self, PipelineError> {
    if !path.is_file() {
      return Err(PipelineError::not_found(
        "configuration file",
        path.display().to_string(),
      ));
    }
    let text = std::fs::read_to_string(path)?;
    Self::from_toml(&text).map_err(|err| match err {
      PipelineError::Configuration { reason, .. } => {
        PipelineError::configuration(path.display().to_string(), reason)
      }
      other => other,
    })
  }

  /// Socket address to bind.
  pub fn address(&self) -> Result<SocketAddr, PipelineError> {
    format!("{}:{}", self.host, self.port)
      .parse()
      .map_err(|err| {
        PipelineError::configuration(
          "field 'host'",
          format!("'{}:{}' is not a socket address: {err}", self.host, self.port),
        )
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_fill_missing_fields() {
    let config = ServiceConfig::from_toml("port = 8080\nplugins = [\"./plugins\"]\n").unwrap();
    assert_eq!(config.port, 8080);
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.plugins, vec![PathBuf::from("./plugins")]);
    assert_eq!(config.log_format, LogFormat::Text);
    assert_eq!(config.address().unwrap().port(), 8080);
  }

  #[test]
  fn test_empty_text_is_default() {
    assert_eq!(ServiceConfig::from_toml("").unwrap(), ServiceConfig::default());
  }

  #[test]
  fn test_invalid_values_are_rejected() {
    assert!(matches!(
      ServiceConfig::from_toml("port = \"high\""),
      Err(PipelineError::Configuration { .. })
    ));
    assert!(ServiceConfig::from_toml("log_format = \"xml\"").is_err());

    let config = ServiceConfig {
      host: "not a host".to_string(),
      ..ServiceConfig::default()
    };
    assert!(config.address().is_err());
  }

  #[test]
  fn test_load_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = ServiceConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { .. }));

    let path = dir.path().join("service.toml");
    std::fs::write(&path, "log_format = \"json\"\nlog_file = \"out.log\"\n").unwrap();
    let config = ServiceConfig::load(&path).unwrap();
    assert_eq!(config.log_format, LogFormat::Json);
    assert_eq!(config.log_file, Some(PathBuf::from("out.log")));
  }
}
