//! Artifact loading and plugin namespaces.

use super::abi::{
  AbiVersionFn, HostServices, NativeRegisterFn, REGISTER_INVALID, REGISTER_OK, REGISTER_PANICKED,
};
use super::manifest::PluginManifest;
use super::{ABI_VERSION_SYMBOL, PLUGIN_ABI_VERSION, REGISTER_SYMBOL};
use crate::error::{NodeError, PipelineError};
use crate::node::{Node, NodeFactory, NodeOptions};
use libloading::{Library, Symbol};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Registration function of a unit linked into the host: fills a
/// [`SymbolTable`].
pub type RegisterFn = fn(&mut SymbolTable);

/// Entry points exported by one artifact, by name.
#[derive(Clone, Default)]
pub struct SymbolTable {
  entries: BTreeMap<String, NodeFactory>,
}

impl SymbolTable {
  /// Creates an empty table.
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers `factory` under `name`.
  pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
  where
    F: Fn(NodeOptions) -> Result<Box<dyn Node>, NodeError> + Send + Sync + 'static,
  {
    self.entries.insert(name.into(), Arc::new(factory));
  }

  /// Looks an entry point up.
  pub fn get(&self, name: &str) -> Option<NodeFactory> {
    self.entries.get(name).cloned()
  }

  /// Exported entry-point names, sorted.
  pub fn names(&self) -> Vec<String> {
    self.entries.keys().cloned().collect()
  }
}

impl fmt::Debug for SymbolTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.entries.keys()).finish()
  }
}

/// A loaded artifact, isolated under the name of its plugin folder.
pub struct PluginNamespace {
  name: String,
  artifact: PathBuf,
  symbols: SymbolTable,
  // Dropped last: factories and node vtables may point into the library.
  _library: Option<Library>,
}

impl PluginNamespace {
  /// Creates a namespace whose code is linked into the host.
  pub fn linked(name: impl Into<String>, artifact: impl Into<PathBuf>, symbols: SymbolTable) -> Self {
    Self {
      name: name.into(),
      artifact: artifact.into(),
      symbols,
      _library: None,
    }
  }

  /// Namespace name (the plugin folder name).
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Artifact the namespace was loaded from.
  pub fn artifact(&self) -> &Path {
    &self.artifact
  }

  /// Exported symbols.
  pub fn symbols(&self) -> &SymbolTable {
    &self.symbols
  }

  /// Looks up the factory for `class_name`, listing the available entry
  /// points when it is missing.
  pub fn entry(&self, class_name: &str) -> Result<NodeFactory, PipelineError> {
    self
      .symbols
      .get(class_name)
      .ok_or_else(|| PipelineError::EntryPointNotFound {
        class_name: class_name.to_string(),
        artifact: self.artifact.display().to_string(),
        available: self.symbols.names(),
      })
  }
}

impl fmt::Debug for PluginNamespace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PluginNamespace")
      .field("name", &self.name)
      .field("artifact", &self.artifact)
      .field("symbols", &self.symbols)
      .field("native", &self._library.is_some())
      .finish()
  }
}

/// Loads one kind of implementation artifact.
pub trait ArtifactLoader: Send + Sync {
  /// Short loader name, for diagnostics.
  fn name(&self) -> &str;

  /// File names this loader accepts for an artifact base name.
  fn artifact_names(&self, stem: &str) -> Vec<String>;

  /// Loads `artifact` into a namespace called `namespace`.
  fn load(&self, namespace: &str, artifact: &Path) -> Result<PluginNamespace, PipelineError>;
}

fn load_error(namespace: &str, reason: impl Into<String>) -> PipelineError {
  PipelineError::Load {
    plugin: namespace.to_string(),
    reason: reason.into(),
  }
}

fn register_guarded(namespace: &str, register: impl FnOnce(&mut SymbolTable)) -> Result<SymbolTable, PipelineError> {
  let mut symbols = SymbolTable::new();
  catch_unwind(AssertUnwindSafe(|| register(&mut symbols)))
    .map_err(|_| load_error(namespace, "registration panicked"))?;
  Ok(symbols)
}

/// Loads shared libraries built with [`export_plugin!`](crate::export_plugin).
#[derive(Debug, Default)]
pub struct NativeLoader;

impl ArtifactLoader for NativeLoader {
  fn name(&self) -> &str {
    "native"
  }

  fn artifact_names(&self, stem: &str) -> Vec<String> {
    let prefix = std::env::consts::DLL_PREFIX;
    let suffix = std::env::consts::DLL_SUFFIX;
    let mut names = vec![format!("{stem}{suffix}")];
    if !prefix.is_empty() {
      names.insert(0, format!("{prefix}{stem}{suffix}"));
    }
    names
  }

  fn load(&self, namespace: &str, artifact: &Path) -> Result<PluginNamespace, PipelineError> {
    // SAFETY: loading a library runs its initialisers. Plugin folders are
    // trusted configuration of the service.
    let library =
      unsafe { Library::new(artifact) }.map_err(|err| load_error(namespace, err.to_string()))?;

    // SAFETY: the symbol type matches the one generated by `export_plugin!`.
    let version = unsafe {
      let symbol: Symbol<AbiVersionFn> = library
        .get(ABI_VERSION_SYMBOL.as_bytes())
        .map_err(|_| load_error(namespace, format!("missing symbol '{ABI_VERSION_SYMBOL}'")))?;
      symbol()
    };
    if version != PLUGIN_ABI_VERSION {
      return Err(load_error(
        namespace,
        format!("ABI version mismatch: expected {PLUGIN_ABI_VERSION}, got {version}"),
      ));
    }

    // SAFETY: as above; the ABI version check ties the plugin to this crate's
    // `SymbolTable` layout and `HostServices`.
    let register: NativeRegisterFn = unsafe {
      let symbol: Symbol<NativeRegisterFn> = library
        .get(REGISTER_SYMBOL.as_bytes())
        .map_err(|_| load_error(namespace, format!("missing symbol '{REGISTER_SYMBOL}'")))?;
      *symbol
    };
    let mut symbols = SymbolTable::new();
    let host = HostServices::current();
    // SAFETY: `symbols` and `host` outlive the call; the plugin contains its
    // own panics and reports them through the status code.
    let status = unsafe { register((&mut symbols as *mut SymbolTable).cast(), &host) };
    match status {
      REGISTER_OK => {}
      REGISTER_PANICKED => return Err(load_error(namespace, "registration panicked")),
      REGISTER_INVALID => return Err(load_error(namespace, "registration rejected the symbol table")),
      other => return Err(load_error(namespace, format!("registration failed with status {other}"))),
    }

    debug!(plugin = %namespace, artifact = %artifact.display(), "native artifact loaded");
    Ok(PluginNamespace {
      name: namespace.to_string(),
      artifact: artifact.to_path_buf(),
      symbols,
      _library: Some(library),
    })
  }
}

/// Loads `.linked` artifacts naming registration units compiled into the host.
#[derive(Default)]
pub struct LinkedLoader {
  units: HashMap<String, RegisterFn>,
}

impl LinkedLoader {
  /// File extension of linked artifacts.
  pub const EXTENSION: &'static str = "linked";

  /// Creates a loader without units.
  pub fn new() -> Self {
    Self::default()
  }

  /// Makes `register` available under `unit`.
  #[must_use]
  pub fn with_unit(mut self, unit: impl Into<String>, register: RegisterFn) -> Self {
    self.units.insert(unit.into(), register);
    self
  }

  /// Makes `register` available under `unit`.
  pub fn add_unit(&mut self, unit: impl Into<String>, register: RegisterFn) {
    self.units.insert(unit.into(), register);
  }
}

impl fmt::Debug for LinkedLoader {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut units: Vec<_> = self.units.keys().collect();
    units.sort();
    f.debug_struct("LinkedLoader").field("units", &units).finish()
  }
}

impl ArtifactLoader for LinkedLoader {
  fn name(&self) -> &str {
    "linked"
  }

  fn artifact_names(&self, stem: &str) -> Vec<String> {
    vec![format!("{stem}.{}", Self::EXTENSION)]
  }

  fn load(&self, namespace: &str, artifact: &Path) -> Result<PluginNamespace, PipelineError> {
    let text = std::fs::read_to_string(artifact).map_err(|err| load_error(namespace, err.to_string()))?;
    let unit = text
      .lines()
      .map(str::trim)
      .find(|line| !line.is_empty() && !line.starts_with('#'))
      .ok_or_else(|| load_error(namespace, "linked artifact names no unit"))?;
    let register = self
      .units
      .get(unit)
      .copied()
      .ok_or_else(|| load_error(namespace, format!("unit '{unit}' is not linked into this binary")))?;
    let symbols = register_guarded(namespace, register)?;

    debug!(plugin = %namespace, unit = %unit, "linked artifact loaded");
    Ok(PluginNamespace::linked(namespace, artifact, symbols))
  }
}

/// A plugin folder resolved into a constructor.
#[derive(Clone)]
pub struct ResolvedPlugin {
  /// Parsed manifest.
  pub manifest: PluginManifest,
  /// Factory of the declared entry point.
  pub factory: NodeFactory,
  /// Namespace the factory lives in.
  pub namespace: Arc<PluginNamespace>,
}

impl fmt::Debug for ResolvedPlugin {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResolvedPlugin")
      .field("manifest", &self.manifest)
      .field("namespace", &self.namespace)
      .finish()
  }
}

/// Resolves plugin folders, caching one namespace per folder.
pub struct PluginLoader {
  loaders: Vec<Box<dyn ArtifactLoader>>,
  cache: Mutex<HashMap<PathBuf, Arc<PluginNamespace>>>,
}

impl PluginLoader {
  /// Creates a loader trying `loaders` in order.
  pub fn new(loaders: Vec<Box<dyn ArtifactLoader>>) -> Self {
    Self {
      loaders,
      cache: Mutex::new(HashMap::new()),
    }
  }

  /// Native libraries plus the given linked units.
  pub fn with_linked(linked: LinkedLoader) -> Self {
    Self::new(vec![Box::new(linked), Box::new(NativeLoader)])
  }

  /// Resolves `folder` into the factory of its declared entry point.
  ///
  /// # Errors
  ///
  /// - `NotFound`: missing folder, manifest or implementation artifact
  /// - `Configuration`: unparsable manifest or missing `class_name`
  /// - `Load`: the artifact cannot be loaded
  /// - `EntryPointNotFound`: the artifact does not export `class_name`
  pub fn load_class(&self, folder: &Path) -> Result<ResolvedPlugin, PipelineError> {
    let manifest = PluginManifest::load(folder)?;
    let (loader, artifact) = self.find_artifact(&manifest)?;

    let key = artifact.canonicalize().unwrap_or_else(|_| artifact.clone());
    let cached = self
      .cache
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(&key)
      .cloned();
    let namespace = match cached {
      Some(namespace) => namespace,
      None => {
        let namespace = Arc::new(loader.load(&manifest.namespace, &artifact)?);
        info!(
          plugin = %manifest.namespace,
          loader = %loader.name(),
          entries = ?namespace.symbols().names(),
          "plugin loaded"
        );
        self
          .cache
          .lock()
          .unwrap_or_else(PoisonError::into_inner)
          .entry(key)
          .or_insert(namespace)
          .clone()
      }
    };

    let factory = namespace.entry(&manifest.class_name)?;
    Ok(ResolvedPlugin {
      manifest,
      factory,
      namespace,
    })
  }

  fn find_artifact(&self, manifest: &PluginManifest) -> Result<(&dyn ArtifactLoader, PathBuf), PipelineError> {
    let mut searched = Vec::new();
    for stem in manifest.artifact_stems() {
      for loader in &self.loaders {
        for name in loader.artifact_names(&stem) {
          let path = manifest.folder.join(&name);
          if path.is_file() {
            return Ok((loader.as_ref(), path));
          }
          searched.push(name);
        }
      }
    }
    Err(PipelineError::not_found(
      "implementation artifact",
      format!("{} (searched: {})", manifest.folder.display(), searched.join(", ")),
    ))
  }

  /// Number of cached namespaces.
  pub fn cached(&self) -> usize {
    self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
  }
}

impl Default for PluginLoader {
  fn default() -> Self {
    Self::with_linked(LinkedLoader::new())
  }
}

impl fmt::Debug for PluginLoader {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let loaders: Vec<_> = self.loaders.iter().map(|loader| loader.name()).collect();
    f.debug_struct("PluginLoader")
      .field("loaders", &loaders)
      .field("cached", &self.cached())
      .finish()
  }
}
