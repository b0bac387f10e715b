//! The handle a node uses to talk to the rest of its pipeline.

use super::NodeIdentity;
use super::queue::{Delivery, InputQueue};
use crate::error::PipelineError;
use crate::message::{Message, VersionCounter};
use indexmap::IndexMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A downstream connection: the consumer's buffers and the origin name the
/// consumer declared for this producer.
#[derive(Clone)]
struct Link {
  target: String,
  origin: String,
  queue: Arc<InputQueue>,
}

/// Feedback messages received by a node, grouped by sender.
#[derive(Debug, Default)]
pub struct FeedbackLedger {
  entries: IndexMap<String, Vec<Arc<Message>>>,
}

impl FeedbackLedger {
  /// Records feedback sent by `sender`.
  pub fn record(&mut self, sender: impl Into<String>, message: Arc<Message>) {
    self.entries.entry(sender.into()).or_default().push(message);
  }

  /// Removes and returns every feedback message sent by `sender`.
  pub fn take(&mut self, sender: &str) -> Vec<Arc<Message>> {
    self.entries.shift_remove(sender).unwrap_or_default()
  }

  /// Number of feedback messages waiting from `sender`.
  pub fn pending(&self, sender: &str) -> usize {
    self.entries.get(sender).map_or(0, Vec::len)
  }
}

/// Runtime services available to a node's hooks.
pub struct NodeContext {
  identity: NodeIdentity,
  origins: Vec<String>,
  folder: PathBuf,
  links: Vec<Link>,
  feedback_routes: IndexMap<String, Link>,
  versions: VersionCounter,
  ledger: Mutex<FeedbackLedger>,
  cancel: CancellationToken,
}

impl NodeContext {
  /// Creates a context without connections.
  pub fn new(identity: NodeIdentity, folder: impl Into<PathBuf>) -> Self {
    Self {
      identity,
      origins: Vec::new(),
      folder: folder.into(),
      links: Vec::new(),
      feedback_routes: IndexMap::new(),
      versions: VersionCounter::new(),
      ledger: Mutex::new(FeedbackLedger::default()),
      cancel: CancellationToken::new(),
    }
  }

  /// Sets the declared origins.
  #[must_use]
  pub fn with_origins<S: Into<String>>(mut self, origins: impl IntoIterator<Item = S>) -> Self {
    self.origins = origins.into_iter().map(Into::into).collect();
    self
  }

  /// Adds a downstream connection: transmitted messages are delivered to
  /// `queue` under `origin`.
  #[must_use]
  pub fn with_link(
    mut self,
    target: impl Into<String>,
    origin: impl Into<String>,
    queue: Arc<InputQueue>,
  ) -> Self {
    self.links.push(Link {
      target: target.into(),
      origin: origin.into(),
      queue,
    });
    self
  }

  /// Adds a feedback route: messages whose feedback names `target` are
  /// delivered to `queue` under `origin`.
  #[must_use]
  pub fn with_feedback_route(
    mut self,
    target: impl Into<String>,
    origin: impl Into<String>,
    queue: Arc<InputQueue>,
  ) -> Self {
    let target = target.into();
    self.feedback_routes.insert(
      target.clone(),
      Link {
        target,
        origin: origin.into(),
        queue,
      },
    );
    self
  }

  /// Sets the cancellation token observed by [`NodeContext::is_stopping`].
  #[must_use]
  pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  /// Node name.
  pub fn name(&self) -> &str {
    &self.identity.name
  }

  /// Owning pipeline name.
  pub fn pipe_name(&self) -> &str {
    &self.identity.pipe_name
  }

  /// Node identity.
  pub fn identity(&self) -> &NodeIdentity {
    &self.identity
  }

  /// Declared origins.
  pub fn origins(&self) -> &[String] {
    &self.origins
  }

  /// Pipeline folder for diagnostic artifacts.
  pub fn folder(&self) -> &Path {
    &self.folder
  }

  /// Names of the downstream nodes.
  pub fn destinations(&self) -> impl Iterator<Item = &str> {
    self.links.iter().map(|link| link.target.as_str())
  }

  /// A fresh version number for a message produced by this node.
  pub fn next_version(&self) -> u64 {
    self.versions.next()
  }

  /// Forwards `message` to every downstream connection, plus its feedback
  /// target when it carries feedback routing.
  ///
  /// A populated draft payload is sealed; an empty draft is rejected. A
  /// version that is not greater than the last transmitted one is
  /// restamped. Returns the transmitted version.
  pub fn transmit(&self, mut message: Message) -> Result<u64, PipelineError> {
    message.payload_mut().seal().map_err(|err| {
      PipelineError::runtime(self.name(), format!("cannot transmit: {err}"))
    })?;

    let proposed = message.version();
    let version = self.versions.admit(proposed);
    if version != proposed {
      debug!(
        node = %self.name(),
        proposed,
        version,
        "restamped stale message version"
      );
      message.set_version(version);
    }

    let message = Arc::new(message);
    for link in &self.links {
      trace!(node = %self.name(), target = %link.target, version, "transmit");
      link.queue.deliver(&link.origin, Arc::clone(&message));
    }

    if let Some(feedback) = message.feedback() {
      match self.feedback_routes.get(&feedback.target) {
        Some(route) => {
          if route.queue.deliver(&route.origin, Arc::clone(&message)) == Delivery::Queued {
            trace!(node = %self.name(), target = %route.target, version, "feedback");
          }
        }
        None => warn!(
          node = %self.name(),
          target = %feedback.target,
          "no feedback link towards target, feedback dropped"
        ),
      }
    }
    Ok(version)
  }

  /// Removes and returns the feedback this node received from `sender`.
  pub fn pick_feedback(&self, sender: &str) -> Vec<Arc<Message>> {
    self.ledger().take(sender)
  }

  /// Number of feedback messages waiting from `sender`.
  pub fn feedback_pending(&self, sender: &str) -> usize {
    self.ledger().pending(sender)
  }

  pub(crate) fn record_feedback(&self, message: &Arc<Message>) {
    self
      .ledger()
      .record(message.creator(), Arc::clone(message));
  }

  fn ledger(&self) -> std::sync::MutexGuard<'_, FeedbackLedger> {
    self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Writes `value` as pretty JSON to `file_name` inside the pipeline folder.
  ///
  /// Path separators in `file_name` are replaced, so the file always lands
  /// directly in the folder. Returns the written path.
  pub async fn dump_json<T: Serialize + ?Sized>(
    &self,
    value: &T,
    file_name: &str,
  ) -> Result<PathBuf, PipelineError> {
    let file_name: String = file_name
      .chars()
      .map(|c| if c == '/' || c == '\\' { '_' } else { c })
      .collect();
    let file_name = match file_name.trim_start_matches('.') {
      "" => "dump.json".to_string(),
      trimmed => trimmed.to_string(),
    };
    let path = self.folder.join(file_name);
    let json = serde_json::to_vec_pretty(value)?;
    tokio::fs::create_dir_all(&self.folder).await?;
    tokio::fs::write(&path, json).await?;
    debug!(node = %self.name(), path = %path.display(), "dumped json");
    Ok(path)
  }

  /// Returns true once the pipeline asked this node to stop.
  pub fn is_stopping(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Completes when the pipeline asks this node to stop.
  pub async fn cancelled(&self) {
    self.cancel.cancelled().await;
  }

  pub(crate) fn cancellation(&self) -> &CancellationToken {
    &self.cancel
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::payload::ObjectPayload;
  use crate::synchroniser::Passthrough;

  fn identity(name: &str) -> NodeIdentity {
    NodeIdentity {
      name: name.to_string(),
      pipe_name: "pipe".to_string(),
    }
  }

  fn object(creator: &str, version: u64) -> Message {
    Message::new(creator, version, ObjectPayload::new().with("v", version))
  }

  #[test]
  fn test_transmit_fans_out_under_declared_origins() {
    let left = Arc::new(InputQueue::new("left", ["up"], None));
    let right = Arc::new(InputQueue::new("right", ["source"], None));
    let ctx = NodeContext::new(identity("up"), "/tmp")
      .with_link("left", "up", Arc::clone(&left))
      .with_link("right", "source", Arc::clone(&right));

    ctx.transmit(object("up", 0)).unwrap();
    assert_eq!(left.pending(), 1);
    assert_eq!(right.pending(), 1);

    let a = left.take_batch(&Passthrough).unwrap().unwrap();
    let b = right.take_batch(&Passthrough).unwrap().unwrap();
    assert!(Arc::ptr_eq(
      &a.from_origin("up")[0],
      &b.from_origin("source")[0]
    ));
  }

  #[test]
  fn test_transmitted_versions_strictly_increase() {
    let queue = Arc::new(InputQueue::new("down", ["up"], None));
    let ctx = NodeContext::new(identity("up"), "/tmp").with_link("down", "up", Arc::clone(&queue));

    assert_eq!(ctx.transmit(object("up", 4)).unwrap(), 4);
    assert_eq!(ctx.transmit(object("up", 4)).unwrap(), 5);
    assert_eq!(ctx.transmit(object("up", 1)).unwrap(), 6);
    assert_eq!(ctx.next_version(), 7);
  }

  #[test]
  fn test_empty_draft_is_rejected() {
    let ctx = NodeContext::new(identity("drafter"), "/tmp");
    let draft = Message::new("drafter", 0, ObjectPayload::draft());
    let err = ctx.transmit(draft).unwrap_err();
    assert!(matches!(err, PipelineError::RuntimeNode { ref node, .. } if node == "drafter"));

    let mut filled = ObjectPayload::draft();
    filled.insert("text", "ready");
    assert!(ctx.transmit(Message::new("drafter", 1, filled)).is_ok());
  }

  #[test]
  fn test_feedback_needs_a_route() {
    let upstream = Arc::new(InputQueue::new("src", ["fb"], None));
    let input = Arc::new(object("src", 0));

    let routed = NodeContext::new(identity("fb"), "/tmp").with_feedback_route(
      "src",
      "fb",
      Arc::clone(&upstream),
    );
    routed
      .transmit(object("fb", 0).with_feedback(Arc::clone(&input), "src"))
      .unwrap();
    assert_eq!(upstream.pending(), 1);

    let unrouted = NodeContext::new(identity("fb"), "/tmp");
    unrouted
      .transmit(object("fb", 0).with_feedback(input, "src"))
      .unwrap();
    assert_eq!(upstream.pending(), 1);
  }

  #[test]
  fn test_pick_feedback_drains_per_sender() {
    let ctx = NodeContext::new(identity("src"), "/tmp");
    ctx.record_feedback(&Arc::new(object("fb", 0)));
    ctx.record_feedback(&Arc::new(object("fb", 1)));
    ctx.record_feedback(&Arc::new(object("other", 0)));

    assert_eq!(ctx.feedback_pending("fb"), 2);
    assert_eq!(ctx.pick_feedback("fb").len(), 2);
    assert!(ctx.pick_feedback("fb").is_empty());
    assert_eq!(ctx.feedback_pending("other"), 1);
  }

  #[tokio::test]
  async fn test_dump_json_stays_in_folder() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = NodeContext::new(identity("dump"), dir.path().join("pipe"));
    let path = ctx
      .dump_json(&object("dump", 0), "../escape/msg.json")
      .await
      .unwrap();

    assert_eq!(path.parent(), Some(dir.path().join("pipe").as_path()));
    let written: Message = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(written.creator(), "dump");
  }
}
