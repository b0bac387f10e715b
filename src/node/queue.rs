//! Per-node input buffering.

use crate::message::Message;
use crate::payload::BatchPayload;
use crate::synchroniser::{
  InvalidSelection, Synchroniser, is_empty_selection, source_view, validate_selection,
};
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::warn;

/// Outcome of a delivery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Delivery {
  /// The message was buffered.
  Queued,
  /// The message was buffered and the oldest message of the origin dropped.
  DroppedOldest,
  /// The origin is not declared by the receiving node; the message was dropped.
  UnknownOrigin,
  /// The receiving node no longer accepts input; the message was dropped.
  Closed,
}

struct Buffers {
  origins: IndexMap<String, VecDeque<Arc<Message>>>,
  accepting: bool,
}

/// Inbound buffers of one node: one FIFO per declared origin.
///
/// Producers call [`InputQueue::deliver`] from any task; the owning node's
/// worker drains the buffers with [`InputQueue::take_batch`]. The
/// synchroniser decision and the removal of the selected messages happen
/// under the same lock, so concurrent deliveries cannot shift the indices of
/// a decision.
pub struct InputQueue {
  owner: String,
  capacity: Option<usize>,
  buffers: Mutex<Buffers>,
  notify: Notify,
}

impl InputQueue {
  /// Creates buffers for `owner` with one FIFO per origin.
  ///
  /// `capacity` bounds every origin buffer; `None` means unbounded.
  pub fn new<S: Into<String>>(
    owner: impl Into<String>,
    origins: impl IntoIterator<Item = S>,
    capacity: Option<usize>,
  ) -> Self {
    Self {
      owner: owner.into(),
      capacity: capacity.filter(|capacity| *capacity > 0),
      buffers: Mutex::new(Buffers {
        origins: origins
          .into_iter()
          .map(|origin| (origin.into(), VecDeque::new()))
          .collect(),
        accepting: true,
      }),
      notify: Notify::new(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Buffers> {
    self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Declared origins, in declaration order.
  pub fn origins(&self) -> Vec<String> {
    self.lock().origins.keys().cloned().collect()
  }

  /// Appends `message` to the buffer of `origin` and wakes the owner.
  pub fn deliver(&self, origin: &str, message: Arc<Message>) -> Delivery {
    let outcome = {
      let mut buffers = self.lock();
      if !buffers.accepting {
        return Delivery::Closed;
      }
      let Some(buffer) = buffers.origins.get_mut(origin) else {
        warn!(
          node = %self.owner,
          origin = %origin,
          creator = %message.creator(),
          "dropping message from undeclared origin"
        );
        return Delivery::UnknownOrigin;
      };
      buffer.push_back(message);
      match self.capacity {
        Some(capacity) if buffer.len() > capacity => {
          buffer.pop_front();
          warn!(
            node = %self.owner,
            origin = %origin,
            capacity,
            "input buffer full, dropped oldest message"
          );
          Delivery::DroppedOldest
        }
        _ => Delivery::Queued,
      }
    };
    self.notify.notify_one();
    outcome
  }

  /// Asks `synchroniser` for a decision and removes the selected messages.
  ///
  /// Returns `Ok(None)` when nothing is buffered or the decision selects
  /// nothing. An invalid decision consumes nothing.
  pub fn take_batch(
    &self,
    synchroniser: &dyn Synchroniser,
  ) -> Result<Option<InputBatch>, InvalidSelection> {
    let mut buffers = self.lock();
    if !buffers.accepting || buffers.origins.values().all(VecDeque::is_empty) {
      return Ok(None);
    }

    let view = source_view(
      buffers
        .origins
        .iter()
        .map(|(origin, buffer)| (origin.as_str(), buffer.len())),
    );
    let selection = synchroniser.next_batch(&view);
    validate_selection(&view, &selection)?;
    if is_empty_selection(&selection) {
      return Ok(None);
    }

    let mut entries = IndexMap::new();
    for (origin, buffer) in buffers.origins.iter_mut() {
      let Some(indices) = selection.get(origin).filter(|indices| !indices.is_empty()) else {
        continue;
      };
      let mut indices = indices.clone();
      indices.sort_unstable();
      let mut taken = Vec::with_capacity(indices.len());
      for index in indices.iter().rev() {
        if let Some(message) = buffer.remove(*index) {
          taken.push(message);
        }
      }
      taken.reverse();
      entries.insert(origin.clone(), taken);
    }
    Ok(Some(InputBatch { entries }))
  }

  /// Returns true when `synchroniser` would select a batch right now.
  pub fn is_ready(&self, synchroniser: &dyn Synchroniser) -> bool {
    let buffers = self.lock();
    if !buffers.accepting || buffers.origins.values().all(VecDeque::is_empty) {
      return false;
    }
    let view = source_view(
      buffers
        .origins
        .iter()
        .map(|(origin, buffer)| (origin.as_str(), buffer.len())),
    );
    let selection = synchroniser.next_batch(&view);
    validate_selection(&view, &selection).is_ok() && !is_empty_selection(&selection)
  }

  /// Stops accepting input and drops everything buffered.
  pub fn close(&self) {
    {
      let mut buffers = self.lock();
      buffers.accepting = false;
      for buffer in buffers.origins.values_mut() {
        buffer.clear();
      }
    }
    self.notify.notify_one();
  }

  /// Returns true while deliveries are accepted.
  pub fn is_open(&self) -> bool {
    self.lock().accepting
  }

  /// Pending message count per origin.
  pub fn snapshot(&self) -> IndexMap<String, usize> {
    self
      .lock()
      .origins
      .iter()
      .map(|(origin, buffer)| (origin.clone(), buffer.len()))
      .collect()
  }

  /// Total number of pending messages.
  pub fn pending(&self) -> usize {
    self.lock().origins.values().map(VecDeque::len).sum()
  }

  /// Waits until a delivery (or close) happens.
  ///
  /// A wake-up issued while nobody waits is kept for the next call.
  pub async fn notified(&self) {
    self.notify.notified().await;
  }
}

/// One synchronised processing unit: the selected messages of each origin.
///
/// Origins appear in declaration order; messages of one origin keep their
/// arrival order.
#[derive(Clone, Debug, Default)]
pub struct InputBatch {
  entries: IndexMap<String, Vec<Arc<Message>>>,
}

impl InputBatch {
  /// Builds a batch from explicit entries.
  pub fn new(entries: IndexMap<String, Vec<Arc<Message>>>) -> Self {
    Self { entries }
  }

  /// Builds a batch holding a single message.
  pub fn single_from(origin: impl Into<String>, message: Arc<Message>) -> Self {
    let mut entries = IndexMap::new();
    entries.insert(origin.into(), vec![message]);
    Self { entries }
  }

  /// Total number of messages.
  pub fn len(&self) -> usize {
    self.entries.values().map(Vec::len).sum()
  }

  /// Returns true when the batch holds no message.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Origins present in the batch.
  pub fn origins(&self) -> impl Iterator<Item = &str> {
    self.entries.keys().map(String::as_str)
  }

  /// Messages selected from `origin`.
  pub fn from_origin(&self, origin: &str) -> &[Arc<Message>] {
    self.entries.get(origin).map(Vec::as_slice).unwrap_or_default()
  }

  /// Iterates over `(origin, message)` pairs.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Message>)> {
    self
      .entries
      .iter()
      .flat_map(|(origin, messages)| messages.iter().map(move |message| (origin.as_str(), message)))
  }

  /// The only message of the batch, if it holds exactly one.
  pub fn single(&self) -> Option<&Arc<Message>> {
    let mut messages = self.iter().map(|(_, message)| message);
    match (messages.next(), messages.next()) {
      (Some(message), None) => Some(message),
      _ => None,
    }
  }

  /// Wraps every message into one message carrying a batch payload.
  ///
  /// The batch metadata records the origin of each message, in order.
  pub fn into_message(self, creator: impl Into<String>, version: u64) -> Message {
    let mut origins = Vec::with_capacity(self.len());
    let mut messages = Vec::with_capacity(self.len());
    for (origin, selected) in self.entries {
      for message in selected {
        origins.push(Value::from(origin.as_str()));
        messages.push(message);
      }
    }
    let mut batch = BatchPayload::new(messages);
    batch.metadata.insert("origins".to_string(), Value::List(origins));
    Message::new(creator, version, batch)
  }
}
