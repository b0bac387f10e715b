//! # Messages
//!
//! The versioned envelope exchanged between nodes.
//!
//! A [`Message`] wraps one [`Payload`] together with the name of the node that
//! produced it, a per-producer version number, open metadata, named duration
//! timers and an optional [`Feedback`] routing annotation.
//!
//! Once transmitted a message is shared behind an [`Arc`] and never mutated
//! again; a consumer that wants to change something builds a new message.
//!
//! ## Timers
//!
//! Durations are recorded with scoped guards:
//!
//! ```rust
//! use tributary::{Message, ObjectPayload};
//!
//! let mut message = Message::new("asr", 0, ObjectPayload::new().with("text", "hi"));
//! {
//!   let _timer = message.timeit("asr_inference");
//!   // work being measured
//! }
//! assert!(message.timers().get("asr_inference").is_some());
//! ```

use crate::payload::Payload;
use crate::value::{Meta, Value};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Named durations, in seconds, in recording order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timers(IndexMap<String, f64>);

impl Timers {
  /// Records `seconds` under `name`, replacing any earlier value.
  pub fn record(&mut self, name: impl Into<String>, seconds: f64) {
    self.0.insert(name.into(), seconds);
  }

  /// Returns the duration recorded under `name`.
  pub fn get(&self, name: &str) -> Option<f64> {
    self.0.get(name).copied()
  }

  /// Number of recorded timers.
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Returns true when nothing was recorded.
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Iterates over `(name, seconds)` pairs.
  pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
    self.0.iter().map(|(name, seconds)| (name.as_str(), *seconds))
  }

  /// Starts a guard that records under `name` when dropped.
  pub fn timeit(&mut self, name: impl Into<String>) -> TimerGuard<'_> {
    TimerGuard {
      timers: self,
      name: Some(name.into()),
      started: Instant::now(),
    }
  }

  fn extend_from(&mut self, other: &Timers) {
    for (name, seconds) in &other.0 {
      self.0.insert(name.clone(), *seconds);
    }
  }
}

/// Records the elapsed time of a scope into [`Timers`].
///
/// The duration is written on drop, so it is recorded on early return, on
/// `?` propagation and while unwinding.
#[must_use = "the duration is recorded when the guard is dropped"]
pub struct TimerGuard<'a> {
  timers: &'a mut Timers,
  name: Option<String>,
  started: Instant,
}

impl TimerGuard<'_> {
  /// Seconds elapsed since the guard was created.
  pub fn elapsed(&self) -> f64 {
    self.started.elapsed().as_secs_f64()
  }
}

impl Drop for TimerGuard<'_> {
  fn drop(&mut self) {
    if let Some(name) = self.name.take() {
      let seconds = self.elapsed();
      self.timers.record(name, seconds);
    }
  }
}

/// Feedback routing annotation.
///
/// A message carrying feedback is additionally delivered to `target`, which
/// sees `message` under the transmitting node's name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
  /// Originating message the feedback refers to.
  pub message: Arc<Message>,
  /// Node that should receive the feedback.
  pub target: String,
}

/// Versioned envelope around a [`Payload`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
  created_at: DateTime<Utc>,
  creator: String,
  version: u64,
  payload: Payload,
  #[serde(default)]
  meta: Meta,
  #[serde(default)]
  timers: Timers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  feedback: Option<Feedback>,
}

impl Message {
  /// Creates a message produced by `creator`.
  pub fn new(creator: impl Into<String>, version: u64, payload: impl Into<Payload>) -> Self {
    Self {
      created_at: Utc::now(),
      creator: creator.into(),
      version,
      payload: payload.into(),
      meta: Meta::new(),
      timers: Timers::default(),
      feedback: None,
    }
  }

  /// Copies the timers recorded on `other` into this message.
  #[must_use]
  pub fn with_timers_from(mut self, other: &Message) -> Self {
    self.timers.extend_from(&other.timers);
    self
  }

  /// Copies the metadata of `other` into this message; existing keys win.
  #[must_use]
  pub fn with_meta_from(mut self, other: &Message) -> Self {
    for (key, value) in &other.meta {
      self.meta.entry(key.clone()).or_insert_with(|| value.clone());
    }
    self
  }

  /// Sets a metadata entry.
  #[must_use]
  pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.meta.insert(key.into(), value.into());
    self
  }

  /// Attaches feedback routing towards `target`.
  #[must_use]
  pub fn with_feedback(mut self, message: Arc<Message>, target: impl Into<String>) -> Self {
    self.feedback = Some(Feedback {
      message,
      target: target.into(),
    });
    self
  }

  /// Starts a scoped timer recorded under `name` on drop.
  pub fn timeit(&mut self, name: impl Into<String>) -> TimerGuard<'_> {
    self.timers.timeit(name)
  }

  /// Creation time.
  pub fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }

  /// Name of the producing node.
  pub fn creator(&self) -> &str {
    &self.creator
  }

  /// Per-producer version number.
  pub fn version(&self) -> u64 {
    self.version
  }

  pub(crate) fn set_version(&mut self, version: u64) {
    self.version = version;
  }

  /// Carried payload.
  pub fn payload(&self) -> &Payload {
    &self.payload
  }

  /// Carried payload, mutably.
  pub fn payload_mut(&mut self) -> &mut Payload {
    &mut self.payload
  }

  /// Consumes the message, returning its payload.
  pub fn into_payload(self) -> Payload {
    self.payload
  }

  /// Metadata entries.
  pub fn meta(&self) -> &Meta {
    &self.meta
  }

  /// Metadata entries, mutably.
  pub fn meta_mut(&mut self) -> &mut Meta {
    &mut self.meta
  }

  /// Recorded timers.
  pub fn timers(&self) -> &Timers {
    &self.timers
  }

  /// Feedback routing, if any.
  pub fn feedback(&self) -> Option<&Feedback> {
    self.feedback.as_ref()
  }
}

/// Per-producer version source.
///
/// Hands out fresh versions and keeps the versions a node transmits strictly
/// increasing.
#[derive(Debug, Default)]
pub struct VersionCounter {
  issued: AtomicU64,
  // One past the last admitted version; 0 until something is transmitted.
  floor: AtomicU64,
}

impl VersionCounter {
  /// Creates a counter whose first version is 0.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns a fresh version.
  pub fn next(&self) -> u64 {
    self.issued.fetch_add(1, Ordering::Relaxed)
  }

  /// Smallest version that would be admitted unchanged.
  #[must_use]
  pub fn floor(&self) -> u64 {
    self.floor.load(Ordering::Acquire)
  }

  /// Admits `proposed` as the next transmitted version.
  ///
  /// Returns `proposed` when it is greater than every version admitted so
  /// far, otherwise one past the last admitted version.
  pub fn admit(&self, proposed: u64) -> u64 {
    let mut admitted = proposed;
    let _ = self
      .floor
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |floor| {
        admitted = proposed.max(floor);
        Some(admitted.saturating_add(1))
      });
    self
      .issued
      .fetch_max(admitted.saturating_add(1), Ordering::Relaxed);
    admitted
  }
}
