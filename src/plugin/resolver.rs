//! Resolution of node entries into factories.

use super::loader::{PluginLoader, PluginNamespace};
use crate::error::PipelineError;
use crate::node::{NodeFactory, NodeKind};
use crate::nodes;
use crate::pipeline::NodeSpec;
use crate::value::Config;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Built-in node implementations by mark.
#[derive(Clone, Default)]
pub struct NodeRegistry {
  factories: BTreeMap<String, NodeFactory>,
}

impl NodeRegistry {
  /// Creates a registry without entries.
  pub fn empty() -> Self {
    Self::default()
  }

  /// Creates a registry holding the bundled nodes.
  pub fn with_builtins() -> Self {
    let mut registry = Self::empty();
    registry.register("counter", Arc::new(nodes::counter::build));
    registry.register("passthrough", Arc::new(nodes::passthrough::build));
    registry.register(
      "passthrough_with_feedback",
      Arc::new(nodes::passthrough_with_feedback::build),
    );
    registry.register("dump", Arc::new(nodes::dump::build));
    registry
  }

  /// Registers `factory` under `mark`, replacing any previous entry.
  pub fn register(&mut self, mark: impl Into<String>, factory: NodeFactory) {
    self.factories.insert(mark.into(), factory);
  }

  /// Looks a mark up.
  pub fn get(&self, mark: &str) -> Option<NodeFactory> {
    self.factories.get(mark).cloned()
  }

  /// Registered marks, sorted.
  pub fn marks(&self) -> Vec<String> {
    self.factories.keys().cloned().collect()
  }
}

impl fmt::Debug for NodeRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NodeRegistry")
      .field("marks", &self.marks())
      .finish()
  }
}

/// Where a node implementation came from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeSource {
  /// Built-in registry.
  Builtin,
  /// Plugin folder.
  Plugin(PathBuf),
}

/// A node entry resolved into a factory plus its defaults.
#[derive(Clone)]
pub struct ResolvedNode {
  /// Constructor of the implementation.
  pub factory: NodeFactory,
  /// Default configuration, overridden by the entry's configuration.
  pub defaults: Config,
  /// Synchroniser declared by the plugin manifest.
  pub sync: Option<String>,
  /// Namespace the factory lives in; kept alive as long as the node.
  pub namespace: Option<Arc<PluginNamespace>>,
  /// Where the implementation came from.
  pub source: NodeSource,
}

impl fmt::Debug for ResolvedNode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResolvedNode")
      .field("defaults", &self.defaults)
      .field("sync", &self.sync)
      .field("source", &self.source)
      .finish()
  }
}

/// Resolves node entries against the built-in registry and plugin folders.
#[derive(Debug)]
pub struct NodeResolver {
  registry: NodeRegistry,
  loader: PluginLoader,
}

impl Default for NodeResolver {
  /// Bundled nodes plus native and (empty) linked plugin loading.
  fn default() -> Self {
    Self::new(NodeRegistry::with_builtins(), PluginLoader::default())
  }
}

impl NodeResolver {
  /// Creates a resolver.
  pub fn new(registry: NodeRegistry, loader: PluginLoader) -> Self {
    Self { registry, loader }
  }

  /// Built-in registry.
  pub fn registry(&self) -> &NodeRegistry {
    &self.registry
  }

  /// Plugin loader.
  pub fn loader(&self) -> &PluginLoader {
    &self.loader
  }

  /// Resolves `entry`.
  ///
  /// An explicit `remote` folder wins; otherwise the built-in registry is
  /// consulted, then each plugin root in order.
  pub fn resolve(&self, entry: &NodeSpec, plugin_roots: &[PathBuf]) -> Result<ResolvedNode, PipelineError> {
    if let Some(folder) = &entry.remote {
      return self.from_folder(folder);
    }
    if let Some(factory) = self.registry.get(&entry.mark) {
      debug!(node = %entry.name, mark = %entry.mark, "resolved built-in node");
      return Ok(ResolvedNode {
        factory,
        defaults: Config::new(),
        sync: None,
        namespace: None,
        source: NodeSource::Builtin,
      });
    }

    let candidates: Vec<PathBuf> = plugin_roots
      .iter()
      .flat_map(|root| plugin_candidates(root, entry.kind, &entry.mark))
      .collect();
    match candidates.iter().find(|folder| folder.is_dir()) {
      Some(folder) => self.from_folder(folder),
      None => Err(PipelineError::not_found(
        "node type",
        format!(
          "'{}' is neither built in (known: {}) nor a plugin folder (searched: {})",
          entry.mark,
          self.registry.marks().join(", "),
          candidates
            .iter()
            .map(|folder| folder.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
        ),
      )),
    }
  }

  fn from_folder(&self, folder: &Path) -> Result<ResolvedNode, PipelineError> {
    let plugin = self.loader.load_class(folder)?;
    Ok(ResolvedNode {
      factory: plugin.factory,
      defaults: plugin.manifest.arguments,
      sync: plugin.manifest.synchroniser,
      namespace: Some(plugin.namespace),
      source: NodeSource::Plugin(plugin.manifest.folder),
    })
  }
}

/// Plugin folders that may hold `mark` under `root`, most specific first.
fn plugin_candidates(root: &Path, kind: NodeKind, mark: &str) -> Vec<PathBuf> {
  let nested = root.join("nodes").join(kind.as_str());
  vec![
    root.join(mark),
    root.join(format!("_{mark}")),
    nested.join(format!("_{mark}")),
    nested.join(mark),
  ]
}
