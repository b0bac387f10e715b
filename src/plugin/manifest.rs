//! Plugin manifest (`config.toml`) parsing.

use crate::error::PipelineError;
use crate::value::{Config, table_to_meta};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// File name of the manifest inside a plugin folder.
pub const MANIFEST_FILE: &str = "config.toml";

#[derive(Debug, Deserialize)]
struct RawManifest {
  remote: Option<RemoteSection>,
  #[serde(default)]
  arguments: toml::Table,
}

#[derive(Debug, Deserialize)]
struct RemoteSection {
  class_name: Option<String>,
  synchroniser: Option<String>,
}

/// Parsed plugin manifest.
#[derive(Clone, Debug)]
pub struct PluginManifest {
  /// Folder the manifest was read from.
  pub folder: PathBuf,
  /// Folder name, used as the plugin namespace.
  pub namespace: String,
  /// Entry point to instantiate.
  pub class_name: String,
  /// Synchroniser declared by the plugin, if any.
  pub synchroniser: Option<String>,
  /// Default node configuration.
  pub arguments: Config,
}

impl PluginManifest {
  /// Reads and validates the manifest of `folder`.
  ///
  /// # Errors
  ///
  /// - `NotFound` when the folder does not exist, is not a directory or has
  ///   no manifest
  /// - `Configuration` when the manifest cannot be read or parsed, or lacks
  ///   `[remote] class_name`
  pub fn load(folder: &Path) -> Result<Self, PipelineError> {
    if !folder.is_dir() {
      return Err(PipelineError::not_found(
        "plugin folder",
        folder.display().to_string(),
      ));
    }
    let path = folder.join(MANIFEST_FILE);
    if !path.is_file() {
      return Err(PipelineError::not_found(
        MANIFEST_FILE,
        folder.display().to_string(),
      ));
    }
    let scope = path.display().to_string();
    let bytes = std::fs::read(&path)
      .map_err(|err| PipelineError::configuration(&scope, format!("cannot read manifest: {err}")))?;
    let text = String::from_utf8(bytes)
      .map_err(|err| PipelineError::configuration(&scope, format!("manifest is not valid UTF-8: {err}")))?;
    Self::parse(folder, &text)
  }

  /// Parses manifest text belonging to `folder`.
  pub fn parse(folder: &Path, text: &str) -> Result<Self, PipelineError> {
    let scope = folder.join(MANIFEST_FILE).display().to_string();
    let raw: RawManifest =
      toml::from_str(text).map_err(|err| PipelineError::configuration(&scope, err.to_string()))?;

    let remote = raw.remote.ok_or_else(|| {
      PipelineError::configuration(&scope, "section [remote] with field 'class_name' is required")
    })?;
    let class_name = remote
      .class_name
      .filter(|name| !name.trim().is_empty())
      .ok_or_else(|| PipelineError::configuration(&scope, "field 'class_name' not found in [remote]"))?;

    Ok(Self {
      folder: folder.to_path_buf(),
      namespace: folder_name(folder),
      class_name,
      synchroniser: remote.synchroniser,
      arguments: Config::from(table_to_meta(raw.arguments)),
    })
  }

  /// Artifact base names accepted for this plugin, most specific first.
  pub fn artifact_stems(&self) -> Vec<String> {
    let mut stems = vec![self.namespace.clone()];
    let stripped = self.namespace.trim_start_matches('_');
    if !stripped.is_empty() && stripped != self.namespace {
      stems.push(stripped.to_string());
    }
    stems
  }
}

fn folder_name(folder: &Path) -> String {
  folder
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_else(|| folder.display().to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::value::Value;

  #[test]
  fn test_parse_full_manifest() {
    let manifest = PluginManifest::parse(
      Path::new("/plugins/_echo"),
      r#"
        [remote]
        class_name = "Echo"
        synchroniser = "one_per_origin"

        [arguments]
        prefix = ">"
        repeat = 2
      "#,
    )
    .unwrap();

    assert_eq!(manifest.class_name, "Echo");
    assert_eq!(manifest.namespace, "_echo");
    assert_eq!(manifest.synchroniser.as_deref(), Some("one_per_origin"));
    assert_eq!(manifest.arguments.get("prefix"), Some(&Value::from(">")));
    assert_eq!(manifest.arguments.u64_or("repeat", 0).unwrap(), 2);
    assert_eq!(manifest.artifact_stems(), vec!["_echo", "echo"]);
  }

  #[test]
  fn test_missing_class_name_is_a_configuration_error() {
    let err = PluginManifest::parse(Path::new("/p/x"), "[remote]\nother = 1\n").unwrap_err();
    assert!(matches!(err, PipelineError::Configuration { .. }));
    assert!(err.to_string().contains("class_name"));

    let err = PluginManifest::parse(Path::new("/p/x"), "[arguments]\na = 1\n").unwrap_err();
    assert!(matches!(err, PipelineError::Configuration { .. }));
  }

  #[test]
  fn test_invalid_toml_is_a_configuration_error() {
    let err = PluginManifest::parse(Path::new("/p/x"), "[remote\nclass_name=").unwrap_err();
    assert!(matches!(err, PipelineError::Configuration { .. }));
  }

  #[test]
  fn test_missing_folder_and_manifest_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = PluginManifest::load(&dir.path().join("absent")).unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { .. }));

    let file = dir.path().join("file");
    std::fs::write(&file, "x").unwrap();
    let err = PluginManifest::load(&file).unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { .. }));

    let err = PluginManifest::load(dir.path()).unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { ref what, .. } if what == MANIFEST_FILE));
  }

  #[test]
  fn test_arguments_keep_declaration_order() {
    let manifest = PluginManifest::parse(
      Path::new("/plugins/order"),
      r#"
        [remote]
        class_name = "Order"

        [arguments]
        zeta = 1
        alpha = 2
        mu = 3
        lambda = 4
      "#,
    )
    .unwrap();

    let keys: Vec<&str> = manifest.arguments.iter().map(|(key, _)| key.as_str()).collect();
    assert_eq!(keys, vec!["zeta", "alpha", "mu", "lambda"]);
  }

  #[test]
  fn test_undecodable_manifest_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("broken");
    std::fs::create_dir(&folder).unwrap();
    std::fs::write(folder.join(MANIFEST_FILE), b"\xff\xfe[remote]").unwrap();

    let err = PluginManifest::load(&folder).unwrap_err();
    assert!(err.is_client_error());
    match err {
      PipelineError::Configuration { scope, reason } => {
        assert!(scope.contains("broken"));
        assert!(reason.contains("UTF-8"));
      }
      other => panic!("unexpected error: {other}"),
    }
  }
}
