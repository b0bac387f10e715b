//! # Pipelines
//!
//! A [`Pipeline`] is a set of nodes wired together from a declarative
//! [`PipelineRequest`].
//!
//! ## Build
//!
//! [`Pipeline::build`] validates the request, resolves every node entry
//! (built-in registry or plugin folder), instantiates the nodes with their
//! merged configuration, wires input buffers and feedback routes, and runs
//! `configure` then `warmup` on every node in dependency order. When any of
//! these steps fails, the nodes built so far are stopped and destroyed in
//! reverse order before the error is returned, attributed to the failing node.
//!
//! ## Execution
//!
//! [`Pipeline::start`] spawns one worker task per node. [`Pipeline::stop`]
//! cancels every worker, waits for in-flight `update` calls to return and runs
//! the `stop` hooks in dependency order. [`Pipeline::destroy`] runs the
//! `destroy` hooks in reverse order. Both are idempotent.

mod spec;

#[cfg(test)]
mod pipeline_test;

pub use spec::{GraphPlan, LinkSpec, NodeSpec, PipelineRequest, PipelineSpec, Route};

use crate::error::PipelineError;
use crate::message::Message;
use crate::node::{
  Delivery, FailurePolicy, InputQueue, NodeContext, NodeIdentity, NodeKind, NodeOptions,
  NodeReport, NodeRuntime, NodeState, NodeStatus,
};
use crate::plugin::{NodeResolver, NodeSource};
use crate::synchroniser::{Passthrough, Synchroniser, SynchroniserRegistry};
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
  /// Every node is configured and warmed up.
  Ready,
  /// Worker tasks are running.
  Running,
  /// Every node was stopped.
  Stopped,
  /// Every node was destroyed.
  Destroyed,
}

impl fmt::Display for PipelineState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      PipelineState::Ready => "ready",
      PipelineState::Running => "running",
      PipelineState::Stopped => "stopped",
      PipelineState::Destroyed => "destroyed",
    };
    f.write_str(name)
  }
}

/// Point-in-time description of a pipeline.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
  /// Pipeline identifier.
  pub id: String,
  /// Pipeline name.
  pub name: String,
  /// Lifecycle state.
  pub state: PipelineState,
  /// Folder for pipeline-scoped artifacts.
  pub folder: PathBuf,
  /// Node reports in dependency order.
  pub nodes: Vec<NodeReport>,
}

struct Slot {
  name: String,
  kind: NodeKind,
  status: Arc<NodeStatus>,
  queue: Arc<InputQueue>,
  synchroniser: Arc<dyn Synchroniser>,
  runtime: Option<NodeRuntime>,
  handle: Option<JoinHandle<NodeRuntime>>,
}

/// A built pipeline.
pub struct Pipeline {
  id: String,
  name: String,
  folder: PathBuf,
  state: PipelineState,
  cancel: CancellationToken,
  routes: IndexMap<String, Vec<Route>>,
  slots: Vec<Slot>,
}

impl fmt::Debug for Pipeline {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pipeline")
      .field("id", &self.id)
      .field("name", &self.name)
      .field("state", &self.state)
      .field(
        "nodes",
        &self.slots.iter().map(|slot| slot.name.as_str()).collect::<Vec<_>>(),
      )
      .finish()
  }
}

impl Pipeline {
  /// Builds, configures and warms up every node of `request`.
  ///
  /// `folder` must exist; it is handed to every node for its artifacts.
  pub async fn build(
    id: impl Into<String>,
    request: &PipelineRequest,
    folder: impl Into<PathBuf>,
    resolver: &NodeResolver,
    synchronisers: &SynchroniserRegistry,
  ) -> Result<Self, PipelineError> {
    let id = id.into();
    let folder = folder.into();
    let plan = request.plan()?;
    let spec = &request.pipeline;
    let entries: IndexMap<&str, &NodeSpec> =
      spec.nodes.iter().map(|entry| (entry.name.as_str(), entry)).collect();

    let queues: IndexMap<String, Arc<InputQueue>> = plan
      .order
      .iter()
      .map(|name| {
        let origins = plan.origins.get(name).cloned().unwrap_or_default();
        let capacity = entries.get(name.as_str()).and_then(|entry| entry.buffer_capacity);
        (name.clone(), Arc::new(InputQueue::new(name.clone(), origins, capacity)))
      })
      .collect();

    let cancel = CancellationToken::new();
    let mut pipeline = Pipeline {
      id,
      name: spec.name.clone(),
      folder,
      state: PipelineState::Ready,
      cancel,
      routes: plan.routes.clone(),
      slots: Vec::with_capacity(plan.order.len()),
    };
    info!(
      pipeline = %pipeline.id,
      name = %pipeline.name,
      nodes = plan.order.len(),
      "building pipeline"
    );

    for name in &plan.order {
      let Some(entry) = entries.get(name.as_str()) else {
        continue;
      };
      let built = pipeline
        .instantiate(entry, &plan, &queues, &request.plugins, resolver, synchronisers)
        .map_err(|err| err.at_node(name));
      match built {
        Ok(slot) => pipeline.slots.push(slot),
        Err(err) => return Err(pipeline.unwind(err).await),
      }
    }

    for index in 0..pipeline.slots.len() {
      let outcome = match pipeline.slots[index].runtime.as_mut() {
        Some(runtime) => match runtime.configure().await {
          Ok(()) => runtime.warmup().await,
          Err(err) => Err(err),
        },
        None => Ok(()),
      };
      if let Err(err) = outcome {
        let node = pipeline.slots[index].name.clone();
        return Err(pipeline.unwind(err.at_node(node)).await);
      }
    }

    info!(pipeline = %pipeline.id, name = %pipeline.name, "pipeline ready");
    Ok(pipeline)
  }

  fn instantiate(
    &self,
    entry: &NodeSpec,
    plan: &GraphPlan,
    queues: &IndexMap<String, Arc<InputQueue>>,
    plugin_roots: &[PathBuf],
    resolver: &NodeResolver,
    synchronisers: &SynchroniserRegistry,
  ) -> Result<Slot, PipelineError> {
    let scope = format!("node '{}'", entry.name);
    let resolved = resolver.resolve(entry, plugin_roots)?;

    let mut config = resolved.defaults.clone();
    config.merge(&entry.configuration);
    let policy = FailurePolicy::from_config(&config)?;
    let sync = entry.sync.clone().or(resolved.sync.clone());

    let options = NodeOptions {
      name: entry.name.clone(),
      pipe_name: self.name.clone(),
      kind: entry.kind,
      mark: entry.mark.clone(),
      config,
      sync: sync.clone(),
    };
    let node = (resolved.factory)(options).map_err(|err| {
      PipelineError::from_node_error(err, |reason| PipelineError::configuration(&scope, reason))
    })?;

    let synchroniser: Arc<dyn Synchroniser> = match &sync {
      Some(name) => synchronisers.resolve(name, &scope)?,
      None => node.synchroniser().unwrap_or_else(|| Arc::new(Passthrough)),
    };

    let queue = queues
      .get(&entry.name)
      .cloned()
      .ok_or_else(|| PipelineError::configuration(&scope, "no input buffers were created"))?;
    let origins = plan.origins.get(&entry.name).cloned().unwrap_or_default();

    let mut ctx = NodeContext::new(
      NodeIdentity {
        name: entry.name.clone(),
        pipe_name: self.name.clone(),
      },
      self.folder.clone(),
    )
    .with_origins(origins)
    .with_cancellation(self.cancel.child_token());
    for route in plan.routes.get(&entry.name).into_iter().flatten() {
      if let Some(target) = queues.get(&route.to) {
        ctx = ctx.with_link(&route.to, &route.origin, Arc::clone(target));
      }
    }
    for route in plan.feedback.get(&entry.name).into_iter().flatten() {
      if let Some(target) = queues.get(&route.to) {
        ctx = ctx.with_feedback_route(&route.to, &route.origin, Arc::clone(target));
      }
    }

    let mark = match &resolved.source {
      NodeSource::Plugin(folder) if entry.mark.is_empty() => folder
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default(),
      _ => entry.mark.clone(),
    };
    let status = Arc::new(NodeStatus::new(&entry.name, mark));
    debug!(
      pipeline = %self.id,
      node = %entry.name,
      kind = %entry.kind,
      synchroniser = %synchroniser.name(),
      source = ?resolved.source,
      "node instantiated"
    );

    let runtime = NodeRuntime::new(
      node,
      Arc::new(ctx),
      Arc::clone(&queue),
      Arc::clone(&synchroniser),
      policy,
      Arc::clone(&status),
      resolved.namespace,
    );
    Ok(Slot {
      name: entry.name.clone(),
      kind: entry.kind,
      status,
      queue,
      synchroniser,
      runtime: Some(runtime),
      handle: None,
    })
  }

  /// Releases the nodes built so far and returns `err`.
  async fn unwind(&mut self, err: PipelineError) -> PipelineError {
    error!(pipeline = %self.id, error = %err, "pipeline build failed, releasing built nodes");
    self.cancel.cancel();
    for slot in self.slots.iter_mut().rev() {
      if let Some(runtime) = slot.runtime.as_mut() {
        runtime.destroy().await;
      }
    }
    self.state = PipelineState::Destroyed;
    err
  }

  /// Pipeline identifier.
  pub fn id(&self) -> &str {
    &self.id
  }

  /// Pipeline name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Folder for pipeline-scoped artifacts.
  pub fn folder(&self) -> &Path {
    &self.folder
  }

  /// Lifecycle state.
  pub fn state(&self) -> PipelineState {
    self.state
  }

  /// Node names in dependency order.
  pub fn node_names(&self) -> Vec<String> {
    self.slots.iter().map(|slot| slot.name.clone()).collect()
  }

  /// Lifecycle state of one node.
  pub fn node_state(&self, node: &str) -> Option<NodeState> {
    self.slot(node).map(|slot| slot.status.state())
  }

  /// Downstream connections of `node`, excluding feedback routes.
  pub fn downstream(&self, node: &str) -> &[Route] {
    self.routes.get(node).map_or(&[], Vec::as_slice)
  }

  /// Snapshot of the pipeline and every node.
  pub fn report(&self) -> PipelineReport {
    PipelineReport {
      id: self.id.clone(),
      name: self.name.clone(),
      state: self.state,
      folder: self.folder.clone(),
      nodes: self
        .slots
        .iter()
        .map(|slot| slot.status.report(slot.queue.pending()))
        .collect(),
    }
  }

  fn slot(&self, node: &str) -> Option<&Slot> {
    self.slots.iter().find(|slot| slot.name == node)
  }

  /// Spawns one worker task per node.
  pub fn start(&mut self) -> Result<(), PipelineError> {
    if self.state != PipelineState::Ready {
      return Err(PipelineError::configuration(
        format!("pipeline '{}'", self.id),
        format!("cannot start a pipeline in state '{}'", self.state),
      ));
    }
    for slot in &mut self.slots {
      if let Some(runtime) = slot.runtime.take() {
        slot.handle = Some(runtime.spawn());
      }
    }
    self.state = PipelineState::Running;
    info!(pipeline = %self.id, name = %self.name, "pipeline running");
    Ok(())
  }

  /// Hands `message` to `node` as if it came from `origin`.
  pub fn deliver(
    &self,
    node: &str,
    origin: &str,
    message: Message,
  ) -> Result<Delivery, PipelineError> {
    let slot = self
      .slot(node)
      .ok_or_else(|| PipelineError::not_found("node", format!("'{node}' in pipeline '{}'", self.id)))?;
    Ok(slot.queue.deliver(origin, Arc::new(message)))
  }

  /// Returns true when every node has returned from `start`, has no
  /// `update` in flight and no buffered input its synchroniser would select.
  pub fn is_idle(&self) -> bool {
    self.slots.iter().all(|slot| {
      let state = slot.status.state();
      state >= NodeState::Failed
        || (slot.status.has_started()
          && !slot.status.is_busy()
          && !slot.queue.is_ready(slot.synchroniser.as_ref()))
    })
  }

  /// Waits until two consecutive observations, `poll` apart, find the
  /// pipeline idle with no batch processed in between.
  pub async fn wait_idle(&self, poll: Duration) {
    let mut previous: Option<u64> = None;
    loop {
      let processed = self.processed();
      if self.is_idle() {
        if previous == Some(processed) {
          return;
        }
        previous = Some(processed);
      } else {
        previous = None;
      }
      tokio::time::sleep(poll).await;
    }
  }

  fn processed(&self) -> u64 {
    self.slots.iter().map(|slot| slot.status.processed()).sum()
  }

  /// Number of source nodes.
  pub fn sources(&self) -> usize {
    self
      .slots
      .iter()
      .filter(|slot| slot.kind == NodeKind::Source)
      .count()
  }

  /// Stops every node in dependency order. Idempotent.
  ///
  /// No `update` call starts after this is invoked; calls already in flight
  /// are awaited.
  pub async fn stop(&mut self) {
    if matches!(self.state, PipelineState::Stopped | PipelineState::Destroyed) {
      return;
    }
    info!(pipeline = %self.id, name = %self.name, "stopping pipeline");
    self.cancel.cancel();
    for slot in &mut self.slots {
      if let Some(handle) = slot.handle.take() {
        match handle.await {
          Ok(runtime) => slot.runtime = Some(runtime),
          Err(err) => {
            error!(pipeline = %self.id, node = %slot.name, error = %err, "worker task lost")
          }
        }
      }
      if let Some(runtime) = slot.runtime.as_mut() {
        runtime.stop().await;
      }
    }
    self.state = PipelineState::Stopped;
  }

  /// Stops the pipeline if needed, then destroys every node in reverse
  /// dependency order. Idempotent.
  pub async fn destroy(&mut self) {
    if self.state == PipelineState::Destroyed {
      return;
    }
    self.stop().await;
    for slot in self.slots.iter_mut().rev() {
      if let Some(runtime) = slot.runtime.as_mut() {
        runtime.destroy().await;
      }
    }
    self.state = PipelineState::Destroyed;
    info!(pipeline = %self.id, name = %self.name, "pipeline destroyed");
  }
}

impl Drop for Pipeline {
  fn drop(&mut self) {
    if matches!(self.state, PipelineState::Running) {
      warn!(pipeline = %self.id, "pipeline dropped while running, cancelling workers");
      self.cancel.cancel();
    }
  }
}
