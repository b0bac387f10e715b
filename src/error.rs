//! # Error Handling
//!
//! Error taxonomy for building, running and managing pipelines.
//!
//! Every failure surfaced to a caller of the pipeline manager is a
//! [`PipelineError`]. Each variant names the plugin, node or field that caused
//! it so transports can return a descriptive message instead of a trace.
//!
//! ## Taxonomy
//!
//! - **Configuration**: bad or missing manifest fields, unknown synchroniser
//!   names, invalid node options, malformed pipeline specifications
//! - **NotFound**: missing plugin folder, manifest, implementation artifact or
//!   node type
//! - **Load**: an implementation artifact exists but cannot be loaded
//! - **EntryPointNotFound**: the artifact does not export the declared class
//! - **Build**: graph construction failed after nodes were instantiated; the
//!   already warmed nodes have been released when this is returned
//! - **RuntimeNode**: a failure inside one node while the pipeline runs
//!
//! Node hooks return the looser [`NodeError`] so plugin authors can use `?` on
//! any error type. The runtime converts those into [`PipelineError`] values,
//! keeping the original variant when a hook returns a boxed `PipelineError`.

use thiserror::Error;

/// Error type returned by node hooks.
///
/// This mirrors the boxed error shape used by node execution so that node
/// implementations can propagate any error with `?`.
pub type NodeError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced while building, running or managing pipelines.
#[derive(Error, Debug)]
pub enum PipelineError {
  /// Invalid configuration: manifest fields, node options, synchroniser names
  /// or pipeline specification structure.
  #[error("configuration error in {scope}: {reason}")]
  Configuration {
    /// What was being configured (node, field, manifest path, ...).
    scope: String,
    /// Why the configuration was rejected.
    reason: String,
  },

  /// A plugin folder, manifest, artifact or node type does not exist.
  #[error("{what} not found: {location}")]
  NotFound {
    /// The kind of thing that was looked up.
    what: String,
    /// Where it was looked up.
    location: String,
  },

  /// An implementation artifact exists but failed to load or initialise.
  #[error("failed to load plugin '{plugin}': {reason}")]
  Load {
    /// Plugin namespace (folder name).
    plugin: String,
    /// Loader diagnostic.
    reason: String,
  },

  /// The declared entry point is not exported by the loaded artifact.
  #[error("entry point '{class_name}' not found in {artifact}; available: {available:?}")]
  EntryPointNotFound {
    /// Declared entry point name.
    class_name: String,
    /// Artifact that was searched.
    artifact: String,
    /// Entry points the artifact does export.
    available: Vec<String>,
  },

  /// Pipeline construction failed at a specific node.
  #[error("failed to build node '{node}': {source}")]
  Build {
    /// Node whose construction failed.
    node: String,
    /// Underlying failure.
    source: Box<PipelineError>,
  },

  /// Failure inside a running node, contained at the node boundary.
  #[error("node '{node}' failed: {reason}")]
  RuntimeNode {
    /// Failing node.
    node: String,
    /// Failure description.
    reason: String,
  },

  /// No pipeline is registered under the identifier.
  #[error("pipeline '{0}' is not registered")]
  UnknownPipeline(String),

  /// Filesystem failure.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// JSON encoding or decoding failure.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl PipelineError {
  /// Creates a configuration error.
  pub fn configuration(scope: impl Into<String>, reason: impl Into<String>) -> Self {
    PipelineError::Configuration {
      scope: scope.into(),
      reason: reason.into(),
    }
  }

  /// Creates a not-found error.
  pub fn not_found(what: impl Into<String>, location: impl Into<String>) -> Self {
    PipelineError::NotFound {
      what: what.into(),
      location: location.into(),
    }
  }

  /// Creates a runtime error attributed to a node.
  pub fn runtime(node: impl Into<String>, reason: impl Into<String>) -> Self {
    PipelineError::RuntimeNode {
      node: node.into(),
      reason: reason.into(),
    }
  }

  /// Wraps this error as a build failure of `node`.
  ///
  /// Errors that are already attributed to a node are returned unchanged.
  pub fn at_node(self, node: impl Into<String>) -> Self {
    match self {
      PipelineError::Build { .. } => self,
      other => PipelineError::Build {
        node: node.into(),
        source: Box::new(other),
      },
    }
  }

  /// Converts an error returned by a node hook.
  ///
  /// Boxed `PipelineError` values keep their variant; any other error is
  /// turned into a value built by `fallback` from its message.
  pub fn from_node_error(err: NodeError, fallback: impl FnOnce(String) -> PipelineError) -> Self {
    match err.downcast::<PipelineError>() {
      Ok(err) => *err,
      Err(err) => fallback(err.to_string()),
    }
  }

  /// Stable, machine-readable name of the error kind.
  pub fn kind(&self) -> &'static str {
    match self {
      PipelineError::Configuration { .. } => "configuration_error",
      PipelineError::NotFound { .. } => "not_found_error",
      PipelineError::Load { .. } => "load_error",
      PipelineError::EntryPointNotFound { .. } => "entry_point_not_found",
      PipelineError::Build { .. } => "build_error",
      PipelineError::RuntimeNode { .. } => "runtime_node_error",
      PipelineError::UnknownPipeline(_) => "unknown_pipeline",
      PipelineError::Io(_) => "io_error",
      PipelineError::Serialization(_) => "serialization_error",
    }
  }

  /// Returns true when the caller supplied something invalid (4xx class).
  ///
  /// Build errors inherit the classification of their cause.
  pub fn is_client_error(&self) -> bool {
    match self {
      PipelineError::Configuration { .. }
      | PipelineError::NotFound { .. }
      | PipelineError::EntryPointNotFound { .. }
      | PipelineError::UnknownPipeline(_)
      | PipelineError::Serialization(_) => true,
      PipelineError::Build { source, .. } => source.is_client_error(),
      PipelineError::Load { .. } | PipelineError::RuntimeNode { .. } | PipelineError::Io(_) => {
        false
      }
    }
  }

  /// Innermost cause, looking through build wrappers.
  pub fn root(&self) -> &PipelineError {
    match self {
      PipelineError::Build { source, .. } => source.root(),
      other => other,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_build_wrapping_is_not_nested() {
    let err = PipelineError::configuration("option 'delay'", "expected a number").at_node("fb");
    let again = err.at_node("other");
    match &again {
      PipelineError::Build { node, .. } => assert_eq!(node, "fb"),
      other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(again.root(), PipelineError::Configuration { .. }));
  }

  #[test]
  fn test_client_error_classification() {
    assert!(PipelineError::not_found("plugin folder", "/nope").is_client_error());
    assert!(
      !PipelineError::Load {
        plugin: "p".to_string(),
        reason: "boom".to_string()
      }
      .is_client_error()
    );
    let warmup = PipelineError::runtime("n", "warmup failed").at_node("n");
    assert!(!warmup.is_client_error());
    assert_eq!(warmup.kind(), "build_error");
  }

  #[test]
  fn test_from_node_error_keeps_pipeline_variant() {
    let boxed: NodeError = Box::new(PipelineError::configuration("option 'x'", "missing"));
    let err = PipelineError::from_node_error(boxed, |reason| PipelineError::runtime("n", reason));
    assert!(matches!(err, PipelineError::Configuration { .. }));

    let boxed: NodeError = "plain failure".into();
    let err = PipelineError::from_node_error(boxed, |reason| PipelineError::runtime("n", reason));
    assert_eq!(err.to_string(), "node 'n' failed: plain failure");
  }

  #[test]
  fn test_entry_point_message_lists_candidates() {
    let err = PipelineError::EntryPointNotFound {
      class_name: "Missing".to_string(),
      artifact: "echo.linked".to_string(),
      available: vec!["Echo".to_string(), "Other".to_string()],
    };
    let message = err.to_string();
    assert!(message.contains("Missing"));
    assert!(message.contains("\"Echo\""));
  }
}
