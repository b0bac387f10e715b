//! # Pipeline Manager
//!
//! Registry of running pipelines, shared by the transport layer.
//!
//! The manager is constructed once at service start and passed around behind
//! an [`Arc`](std::sync::Arc); it is not a global. Creating a pipeline reserves a fresh
//! identifier under the registry lock, builds the pipeline outside the lock
//! and registers it only once it is running, so a failed build never leaves a
//! partial registration behind.
//!
//! ## Example
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), tributary::PipelineError> {
//! use std::sync::Arc;
//! use tributary::manager::PipelineManager;
//! use tributary::pipeline::PipelineRequest;
//!
//! let manager = Arc::new(PipelineManager::new("./running"));
//! let request = PipelineRequest::from_json(br#"{
//!   "version": "1.0",
//!   "pipeline": {
//!     "name": "demo",
//!     "nodes": [{"name": "src", "type": "source", "mark": "counter"}],
//!     "links": []
//!   }
//! }"#)?;
//! let created = manager.create_pipeline(request).await?;
//! manager.stop_pipeline(&created.pipeline_id).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::PipelineError;
use crate::message::Message;
use crate::node::Delivery;
use crate::pipeline::{Pipeline, PipelineReport, PipelineRequest, PipelineState};
use crate::plugin::NodeResolver;
use crate::synchroniser::SynchroniserRegistry;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of a successful [`PipelineManager::create_pipeline`].
#[derive(Clone, Debug, Serialize)]
pub struct PipelineCreated {
  /// Generated identifier.
  pub pipeline_id: String,
  /// Pipeline name from the request.
  pub name: String,
  /// Lifecycle state after creation.
  pub status: PipelineState,
  /// Folder for the pipeline's artifacts.
  pub folder: PathBuf,
  /// Node names in dependency order.
  pub nodes: Vec<String>,
}

#[derive(Default)]
struct Registry {
  pipelines: HashMap<String, Pipeline>,
  reserved: HashSet<String>,
}

/// Creates, tracks and tears down pipelines.
pub struct PipelineManager {
  registry: Mutex<Registry>,
  base_folder: RwLock<PathBuf>,
  plugin_roots: Vec<PathBuf>,
  resolver: NodeResolver,
  synchronisers: SynchroniserRegistry,
}

impl PipelineManager {
  /// Creates a manager storing pipeline artifacts under `base_folder`.
  ///
  /// The folder is created on first use.
  pub fn new(base_folder: impl Into<PathBuf>) -> Self {
    Self {
      registry: Mutex::new(Registry::default()),
      base_folder: RwLock::new(base_folder.into()),
      plugin_roots: Vec::new(),
      resolver: NodeResolver::default(),
      synchronisers: SynchroniserRegistry::with_builtins(),
    }
  }

  /// Replaces the node resolver.
  #[must_use]
  pub fn with_resolver(mut self, resolver: NodeResolver) -> Self {
    self.resolver = resolver;
    self
  }

  /// Replaces the synchroniser registry.
  #[must_use]
  pub fn with_synchronisers(mut self, synchronisers: SynchroniserRegistry) -> Self {
    self.synchronisers = synchronisers;
    self
  }

  /// Plugin roots searched after the ones named by each request.
  #[must_use]
  pub fn with_plugin_roots(mut self, roots: Vec<PathBuf>) -> Self {
    self.plugin_roots = roots;
    self
  }

  /// Current base folder.
  pub fn base_folder(&self) -> PathBuf {
    self
      .base_folder
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Sets the base folder, creating it if needed.
  pub async fn set_base_folder(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
    let path = path.as_ref().to_path_buf();
    tokio::fs::create_dir_all(&path).await?;
    info!(folder = %path.display(), "base folder set");
    *self
      .base_folder
      .write()
      .unwrap_or_else(PoisonError::into_inner) = path;
    Ok(())
  }

  /// Validates, builds and starts a pipeline, then registers it.
  pub async fn create_pipeline(&self, mut request: PipelineRequest) -> Result<PipelineCreated, PipelineError> {
    request.plan()?;
    request.plugins.extend(self.plugin_roots.iter().cloned());

    let id = self.reserve_id().await;
    let folder = self.base_folder().join(&id);
    let outcome = self.launch(&id, &request, &folder).await;

    let mut registry = self.registry.lock().await;
    registry.reserved.remove(&id);
    match outcome {
      Ok(pipeline) => {
        let created = PipelineCreated {
          pipeline_id: id.clone(),
          name: pipeline.name().to_string(),
          status: pipeline.state(),
          folder,
          nodes: pipeline.node_names(),
        };
        registry.pipelines.insert(id, pipeline);
        info!(pipeline = %created.pipeline_id, name = %created.name, "pipeline registered");
        Ok(created)
      }
      Err(err) => {
        drop(registry);
        // Only succeeds while nothing was written into it.
        if tokio::fs::remove_dir(&folder).await.is_ok() {
          debug!(folder = %folder.display(), "removed unused pipeline folder");
        }
        warn!(
          pipeline = %id,
          name = %request.pipeline.name,
          kind = err.kind(),
          error = %err,
          "pipeline creation failed"
        );
        Err(err)
      }
    }
  }

  async fn launch(&self, id: &str, request: &PipelineRequest, folder: &Path) -> Result<Pipeline, PipelineError> {
    tokio::fs::create_dir_all(folder).await?;
    let mut pipeline = Pipeline::build(id, request, folder, &self.resolver, &self.synchronisers).await?;
    if let Err(err) = pipeline.start() {
      pipeline.destroy().await;
      return Err(err);
    }
    Ok(pipeline)
  }

  async fn reserve_id(&self) -> String {
    let mut registry = self.registry.lock().await;
    loop {
      let id = Uuid::new_v4().to_string();
      if !registry.pipelines.contains_key(&id) && registry.reserved.insert(id.clone()) {
        return id;
      }
    }
  }

  /// Snapshot of one pipeline.
  pub async fn status(&self, id: &str) -> Result<PipelineReport, PipelineError> {
    let registry = self.registry.lock().await;
    registry
      .pipelines
      .get(id)
      .map(Pipeline::report)
      .ok_or_else(|| PipelineError::UnknownPipeline(id.to_string()))
  }

  /// Snapshots of every registered pipeline, sorted by identifier.
  pub async fn list(&self) -> Vec<PipelineReport> {
    let registry = self.registry.lock().await;
    let mut reports: Vec<_> = registry.pipelines.values().map(Pipeline::report).collect();
    reports.sort_by(|a, b| a.id.cmp(&b.id));
    reports
  }

  /// Number of registered pipelines.
  pub async fn len(&self) -> usize {
    self.registry.lock().await.pipelines.len()
  }

  /// Returns true when no pipeline is registered.
  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }

  /// Hands `message` to `node` of pipeline `id` under `origin`.
  pub async fn deliver(
    &self,
    id: &str,
    node: &str,
    origin: &str,
    message: Message,
  ) -> Result<Delivery, PipelineError> {
    let registry = self.registry.lock().await;
    let pipeline = registry
      .pipelines
      .get(id)
      .ok_or_else(|| PipelineError::UnknownPipeline(id.to_string()))?;
    pipeline.deliver(node, origin, message)
  }

  /// Stops, destroys and unregisters one pipeline. Other pipelines are not
  /// affected.
  pub async fn stop_pipeline(&self, id: &str) -> Result<PipelineReport, PipelineError> {
    let mut pipeline = self
      .registry
      .lock()
      .await
      .pipelines
      .remove(id)
      .ok_or_else(|| PipelineError::UnknownPipeline(id.to_string()))?;
    pipeline.destroy().await;
    info!(pipeline = %id, "pipeline removed");
    Ok(pipeline.report())
  }

  /// Tears down every registered pipeline.
  pub async fn shutdown(&self) {
    let pipelines: Vec<Pipeline> = {
      let mut registry = self.registry.lock().await;
      registry.pipelines.drain().map(|(_, pipeline)| pipeline).collect()
    };
    info!(pipelines = pipelines.len(), "shutting down pipelines");
    for mut pipeline in pipelines {
      pipeline.destroy().await;
    }
  }
}

impl std::fmt::Debug for PipelineManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PipelineManager")
      .field("base_folder", &self.base_folder())
      .field("plugin_roots", &self.plugin_roots)
      .field("resolver", &self.resolver)
      .finish()
  }
}
