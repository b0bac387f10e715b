//! # Nodes
//!
//! This module defines the [`Node`] trait, the unit of computation of a
//! pipeline, together with the types the engine uses to construct, wire and
//! supervise nodes.
//!
//! ## Lifecycle
//!
//! ```text
//! created -> configured -> warmed_up -> running -> stopped -> destroyed
//!                                          \
//!                                           -> failed -> stopped -> destroyed
//! ```
//!
//! - [`Node::configure`] validates options and derives internal state; it must
//!   not acquire expensive resources.
//! - [`Node::warmup`] acquires expensive resources and is called exactly once.
//! - [`Node::start`] runs once when the pipeline starts. Sources emit from here.
//! - [`Node::update`] receives one synchronised [`InputBatch`] at a time and
//!   emits results with [`NodeContext::transmit`].
//! - [`Node::stop`] and [`Node::destroy`] release resources. The runtime calls
//!   each at most once, and always performs the common teardown (input is no
//!   longer accepted, buffers are dropped) regardless of what the hook does.
//!
//! Lifecycle bookkeeping lives in the runtime wrapper, not in node code, so a
//! node implementation only writes the hooks it needs.
//!
//! ## Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use tributary::node::{InputBatch, Node, NodeContext};
//! use tributary::{Message, NodeError, ObjectPayload};
//!
//! struct Upper;
//!
//! #[async_trait]
//! impl Node for Upper {
//!   async fn update(&mut self, batch: InputBatch, ctx: &NodeContext) -> Result<(), NodeError> {
//!     for (_, message) in batch.iter() {
//!       let text = message
//!         .payload()
//!         .as_object()
//!         .and_then(|object| object.get("text"))
//!         .and_then(|value| value.as_str())
//!         .unwrap_or_default()
//!         .to_uppercase();
//!       let out = Message::new(ctx.name(), ctx.next_version(), ObjectPayload::new().with("text", text))
//!         .with_timers_from(message);
//!       ctx.transmit(out)?;
//!     }
//!     Ok(())
//!   }
//! }
//! ```

mod context;
mod queue;
mod runtime;
mod supervision;


pub use context::{FeedbackLedger, NodeContext};
pub use queue::{Delivery, InputBatch, InputQueue};
pub(crate) use runtime::{NodeRuntime, panic_message};
pub use supervision::{FailureAction, FailurePolicy, FailureReport};

use crate::error::NodeError;
use crate::payload::PayloadKind;
use crate::synchroniser::Synchroniser;
use crate::value::Config;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// A processing stage of a pipeline.
///
/// Only [`Node::update`] is required; every other hook defaults to a no-op.
#[async_trait]
pub trait Node: Send + Sync {
  /// Validates options and derives configuration-dependent state.
  async fn configure(&mut self, _ctx: &NodeContext) -> Result<(), NodeError> {
    Ok(())
  }

  /// Acquires expensive resources. Failure aborts the pipeline build.
  async fn warmup(&mut self, _ctx: &NodeContext) -> Result<(), NodeError> {
    Ok(())
  }

  /// Called once when the pipeline starts running.
  ///
  /// Sources emit from here and should return once
  /// [`NodeContext::is_stopping`] turns true.
  async fn start(&mut self, _ctx: &NodeContext) -> Result<(), NodeError> {
    Ok(())
  }

  /// Processes one synchronised batch.
  async fn update(&mut self, batch: InputBatch, ctx: &NodeContext) -> Result<(), NodeError>;

  /// Stops processing. Called at most once.
  async fn stop(&mut self) -> Result<(), NodeError> {
    Ok(())
  }

  /// Releases every resource. Called at most once, after [`Node::stop`].
  async fn destroy(&mut self) -> Result<(), NodeError> {
    Ok(())
  }

  /// The synchroniser this node prefers when none is configured.
  fn synchroniser(&self) -> Option<Arc<dyn Synchroniser>> {
    None
  }

  /// Payload kinds this node accepts. Documentation only.
  fn accepts(&self) -> &[PayloadKind] {
    PayloadKind::ALL
  }

  /// Payload kinds this node produces. Documentation only.
  fn produces(&self) -> &[PayloadKind] {
    PayloadKind::ALL
  }
}

/// Role of a node in the graph.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
  /// Produces messages without upstream input.
  Source,
  /// Transforms messages.
  #[default]
  Proc,
  /// Consumes messages.
  Sink,
}

impl NodeKind {
  /// Lowercase name, as used in pipeline specifications and plugin folders.
  pub fn as_str(&self) -> &'static str {
    match self {
      NodeKind::Source => "source",
      NodeKind::Proc => "proc",
      NodeKind::Sink => "sink",
    }
  }
}

impl fmt::Display for NodeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Who a node is.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NodeIdentity {
  /// Node name, unique within its pipeline.
  pub name: String,
  /// Name of the owning pipeline.
  pub pipe_name: String,
}

/// Everything a [`NodeFactory`] receives to build a node.
///
/// `config` holds the plugin defaults overridden by the pipeline entry;
/// identity and the configured synchroniser name are injected last.
#[derive(Clone, Debug)]
pub struct NodeOptions {
  /// Node name.
  pub name: String,
  /// Name of the owning pipeline.
  pub pipe_name: String,
  /// Declared role.
  pub kind: NodeKind,
  /// Implementation reference the node was resolved from.
  pub mark: String,
  /// Merged configuration.
  pub config: Config,
  /// Synchroniser named by the pipeline entry or plugin manifest.
  pub sync: Option<String>,
}

impl NodeOptions {
  /// Creates options for a node with an empty configuration.
  pub fn new(name: impl Into<String>, pipe_name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      pipe_name: pipe_name.into(),
      kind: NodeKind::default(),
      mark: String::new(),
      config: Config::new(),
      sync: None,
    }
  }

  /// Replaces the configuration.
  #[must_use]
  pub fn with_config(mut self, config: Config) -> Self {
    self.config = config;
    self
  }

  /// Identity of the node being built.
  pub fn identity(&self) -> NodeIdentity {
    NodeIdentity {
      name: self.name.clone(),
      pipe_name: self.pipe_name.clone(),
    }
  }
}

/// Constructor handle for a node implementation.
pub type NodeFactory = Arc<dyn Fn(NodeOptions) -> Result<Box<dyn Node>, NodeError> + Send + Sync>;

/// Lifecycle state of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum NodeState {
  /// Instantiated.
  Created = 0,
  /// `configure` succeeded.
  Configured = 1,
  /// `warmup` succeeded.
  WarmedUp = 2,
  /// Worker task is running.
  Running = 3,
  /// Stopped after an unrecoverable failure; no longer accepts input.
  Failed = 4,
  /// `stop` was performed.
  Stopped = 5,
  /// `destroy` was performed.
  Destroyed = 6,
}

impl NodeState {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => NodeState::Created,
      1 => NodeState::Configured,
      2 => NodeState::WarmedUp,
      3 => NodeState::Running,
      4 => NodeState::Failed,
      5 => NodeState::Stopped,
      _ => NodeState::Destroyed,
    }
  }
}

impl fmt::Display for NodeState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      NodeState::Created => "created",
      NodeState::Configured => "configured",
      NodeState::WarmedUp => "warmed_up",
      NodeState::Running => "running",
      NodeState::Failed => "failed",
      NodeState::Stopped => "stopped",
      NodeState::Destroyed => "destroyed",
    };
    f.write_str(name)
  }
}

/// Shared, lock-free view of a node's progress.
#[derive(Debug)]
pub struct NodeStatus {
  name: String,
  mark: String,
  state: AtomicU8,
  processed: AtomicU64,
  failures: AtomicU64,
  started: AtomicBool,
  busy: AtomicBool,
}

impl NodeStatus {
  pub(crate) fn new(name: impl Into<String>, mark: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      mark: mark.into(),
      state: AtomicU8::new(NodeState::Created as u8),
      processed: AtomicU64::new(0),
      failures: AtomicU64::new(0),
      started: AtomicBool::new(false),
      busy: AtomicBool::new(false),
    }
  }

  /// Current lifecycle state.
  pub fn state(&self) -> NodeState {
    NodeState::from_u8(self.state.load(Ordering::Acquire))
  }

  pub(crate) fn set_state(&self, state: NodeState) {
    self.state.store(state as u8, Ordering::Release);
  }

  /// Number of batches processed successfully.
  pub fn processed(&self) -> u64 {
    self.processed.load(Ordering::Relaxed)
  }

  pub(crate) fn record_processed(&self) {
    self.processed.fetch_add(1, Ordering::Relaxed);
  }

  /// Number of failed `start`/`update` calls.
  pub fn failures(&self) -> u64 {
    self.failures.load(Ordering::Relaxed)
  }

  pub(crate) fn record_failure(&self) -> u64 {
    self.failures.fetch_add(1, Ordering::Relaxed) + 1
  }

  /// Returns true once the `start` hook has returned.
  pub fn has_started(&self) -> bool {
    self.started.load(Ordering::Acquire)
  }

  pub(crate) fn mark_started(&self) {
    self.started.store(true, Ordering::Release);
  }

  /// Returns true while an `update` call is in flight.
  pub fn is_busy(&self) -> bool {
    self.busy.load(Ordering::Acquire)
  }

  pub(crate) fn set_busy(&self, busy: bool) {
    self.busy.store(busy, Ordering::Release);
  }

  /// Serializable snapshot.
  pub fn report(&self, pending: usize) -> NodeReport {
    NodeReport {
      name: self.name.clone(),
      mark: self.mark.clone(),
      state: self.state(),
      processed: self.processed(),
      failures: self.failures(),
      pending,
    }
  }
}

/// Point-in-time description of one node.
#[derive(Clone, Debug, Serialize)]
pub struct NodeReport {
  /// Node name.
  pub name: String,
  /// Implementation reference.
  pub mark: String,
  /// Lifecycle state.
  pub state: NodeState,
  /// Batches processed.
  pub processed: u64,
  /// Failed hook calls.
  pub failures: u64,
  /// Messages waiting in the input buffers.
  pub pending: usize,
}
