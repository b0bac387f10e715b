//! Worker task and lifecycle bookkeeping around one node.

use super::supervision::{FailureAction, FailurePolicy, FailureReport};
use super::{InputBatch, InputQueue, Node, NodeContext, NodeState, NodeStatus};
use crate::error::{NodeError, PipelineError};
use crate::plugin::{PluginNamespace, is_contained_panic};
use crate::synchroniser::Synchroniser;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Owns a node instance and drives its lifecycle.
///
/// The worker returns the runtime through its [`JoinHandle`] so the pipeline
/// can run `stop` and `destroy` after the task ended.
pub(crate) struct NodeRuntime {
  node: Box<dyn Node>,
  ctx: Arc<NodeContext>,
  queue: Arc<InputQueue>,
  synchroniser: Arc<dyn Synchroniser>,
  policy: FailurePolicy,
  status: Arc<NodeStatus>,
  warmed: bool,
  stopped: bool,
  destroyed: bool,
  // Dropped after `node`: the node's code may live in the namespace.
  _namespace: Option<Arc<PluginNamespace>>,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

/// Awaits a hook, turning errors and panics into a [`PipelineError`].
async fn guarded<F>(
  node: &str,
  hook: F,
  fallback: impl FnOnce(String) -> PipelineError,
) -> Result<(), (PipelineError, bool)>
where
  F: Future<Output = Result<(), NodeError>>,
{
  match AssertUnwindSafe(hook).catch_unwind().await {
    Ok(Ok(())) => Ok(()),
    Ok(Err(err)) => {
      let panicked = is_contained_panic(err.as_ref());
      Err((PipelineError::from_node_error(err, fallback), panicked))
    }
    Err(panic) => Err((
      PipelineError::runtime(node, format!("panicked: {}", panic_message(panic.as_ref()))),
      true,
    )),
  }
}

impl NodeRuntime {
  pub(crate) fn new(
    node: Box<dyn Node>,
    ctx: Arc<NodeContext>,
    queue: Arc<InputQueue>,
    synchroniser: Arc<dyn Synchroniser>,
    policy: FailurePolicy,
    status: Arc<NodeStatus>,
    namespace: Option<Arc<PluginNamespace>>,
  ) -> Self {
    Self {
      node,
      ctx,
      queue,
      synchroniser,
      policy,
      status,
      warmed: false,
      stopped: false,
      destroyed: false,
      _namespace: namespace,
    }
  }

  pub(crate) fn name(&self) -> &str {
    self.ctx.name()
  }

  #[cfg(test)]
  pub(crate) fn status(&self) -> &Arc<NodeStatus> {
    &self.status
  }

  #[cfg(test)]
  pub(crate) fn context(&self) -> &Arc<NodeContext> {
    &self.ctx
  }

  /// Runs the `configure` hook.
  pub(crate) async fn configure(&mut self) -> Result<(), PipelineError> {
    let name = self.name().to_string();
    let scope = format!("node '{name}'");
    guarded(&name, self.node.configure(&self.ctx), |reason| {
      PipelineError::configuration(scope, reason)
    })
    .await
    .map_err(|(err, _)| err)?;
    self.status.set_state(NodeState::Configured);
    debug!(node = %name, "configured");
    Ok(())
  }

  /// Runs the `warmup` hook.
  pub(crate) async fn warmup(&mut self) -> Result<(), PipelineError> {
    let name = self.name().to_string();
    guarded(&name, self.node.warmup(&self.ctx), |reason| {
      PipelineError::runtime(&name, format!("warmup failed: {reason}"))
    })
    .await
    .map_err(|(err, _)| err)?;
    self.warmed = true;
    self.status.set_state(NodeState::WarmedUp);
    debug!(node = %name, "warmed up");
    Ok(())
  }

  /// Spawns the worker task.
  pub(crate) fn spawn(self) -> JoinHandle<NodeRuntime> {
    self.status.set_state(NodeState::Running);
    tokio::spawn(self.run())
  }

  async fn run(mut self) -> Self {
    let cancel = self.ctx.cancellation().clone();
    info!(
      node = %self.name(),
      pipeline = %self.ctx.pipe_name(),
      synchroniser = %self.synchroniser.name(),
      "node running"
    );

    if !cancel.is_cancelled() {
      let name = self.name().to_string();
      let outcome = guarded(&name, self.node.start(&self.ctx), |reason| {
        PipelineError::runtime(&name, reason)
      })
      .await;
      if let Err((err, panicked)) = outcome {
        self.contain(err, panicked);
      }
    }
    self.status.mark_started();

    loop {
      if cancel.is_cancelled() || !self.queue.is_open() {
        break;
      }
      match self.queue.take_batch(self.synchroniser.as_ref()) {
        Ok(Some(batch)) => {
          if cancel.is_cancelled() {
            debug!(node = %self.name(), messages = batch.len(), "stopping, batch dropped");
            break;
          }
          self.process(batch).await;
          continue;
        }
        Ok(None) => {}
        Err(invalid) => {
          let err = PipelineError::runtime(
            self.name(),
            format!(
              "synchroniser '{}' returned an invalid decision: {invalid}",
              self.synchroniser.name()
            ),
          );
          error!(node = %self.name(), error = %err, "batch selection rejected");
        }
      }
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        _ = self.queue.notified() => {}
      }
    }
    debug!(node = %self.name(), "worker finished");
    self
  }

  async fn process(&mut self, batch: InputBatch) {
    for (_, message) in batch.iter() {
      let addressed = message
        .feedback()
        .is_some_and(|feedback| feedback.target == self.ctx.name());
      if addressed {
        self.ctx.record_feedback(message);
      }
    }

    let name = self.name().to_string();
    self.status.set_busy(true);
    let outcome = guarded(&name, self.node.update(batch, &self.ctx), |reason| {
      PipelineError::runtime(&name, reason)
    })
    .await;

    match outcome {
      Ok(()) => self.status.record_processed(),
      Err((err, panicked)) => self.contain(err, panicked),
    }
    self.status.set_busy(false);
  }

  fn contain(&mut self, err: PipelineError, panicked: bool) {
    let report = FailureReport {
      node: self.name().to_string(),
      error: err.to_string(),
      count: self.status.record_failure(),
      panicked,
    };
    error!(
      node = %report.node,
      pipeline = %self.ctx.pipe_name(),
      failures = report.count,
      panicked = report.panicked,
      error = %report.error,
      "node failure contained"
    );
    if self.policy.decide(&report) == FailureAction::Stop {
      warn!(node = %report.node, "node stopped after failure, input is no longer accepted");
      self.status.set_state(NodeState::Failed);
      self.queue.close();
    }
  }

  /// Performs the common teardown and the `stop` hook, once.
  pub(crate) async fn stop(&mut self) {
    if self.stopped {
      return;
    }
    self.stopped = true;
    self.ctx.cancellation().cancel();
    self.queue.close();

    if self.warmed {
      let name = self.name().to_string();
      if let Err((err, _)) = guarded(&name, self.node.stop(), |reason| {
        PipelineError::runtime(&name, format!("stop failed: {reason}"))
      })
      .await
      {
        warn!(node = %name, error = %err, "stop hook failed");
      }
    }
    if self.status.state() < NodeState::Stopped {
      self.status.set_state(NodeState::Stopped);
    }
    debug!(node = %self.name(), "stopped");
  }

  /// Stops the node if needed, then runs the `destroy` hook, once.
  pub(crate) async fn destroy(&mut self) {
    self.stop().await;
    if self.destroyed {
      return;
    }
    self.destroyed = true;

    if self.warmed {
      let name = self.name().to_string();
      if let Err((err, _)) = guarded(&name, self.node.destroy(), |reason| {
        PipelineError::runtime(&name, format!("destroy failed: {reason}"))
      })
      .await
      {
        warn!(node = %name, error = %err, "destroy hook failed");
      }
    }
    self.status.set_state(NodeState::Destroyed);
    debug!(node = %self.name(), "destroyed");
  }
}
