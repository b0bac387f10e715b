//! # Payloads
//!
//! Typed containers for the data carried by a [`Message`].
//!
//! A node declares which payload kinds it accepts and produces; the engine
//! treats that declaration as documentation and never inspects payloads while
//! routing. The only payload state the engine enforces is the *draft* state of
//! [`ObjectPayload`]: a draft must be populated before it is transmitted.

use crate::message::Message;
use crate::value::{Meta, Value};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Fieldless discriminant of [`Payload`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
  /// [`AudioPayload`]
  Audio,
  /// [`ImagePayload`]
  Image,
  /// [`VideoPayload`]
  Video,
  /// [`BytesPayload`]
  Bytes,
  /// [`ObjectPayload`]
  Object,
  /// [`BatchPayload`]
  Batch,
}

impl PayloadKind {
  /// Every payload kind.
  pub const ALL: &'static [PayloadKind] = &[
    PayloadKind::Audio,
    PayloadKind::Image,
    PayloadKind::Video,
    PayloadKind::Bytes,
    PayloadKind::Object,
    PayloadKind::Batch,
  ];
}

impl fmt::Display for PayloadKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      PayloadKind::Audio => "audio",
      PayloadKind::Image => "image",
      PayloadKind::Video => "video",
      PayloadKind::Bytes => "bytes",
      PayloadKind::Object => "object",
      PayloadKind::Batch => "batch",
    };
    f.write_str(name)
  }
}

/// A chunk of audio samples.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioPayload {
  /// Interleaved samples.
  pub samples: Vec<f32>,
  /// Samples per second.
  pub sampling_rate: u32,
  /// Number of interleaved channels.
  pub channels: u16,
  /// Sample format tag (e.g. `flt`, `s16`).
  pub format: String,
  /// Start of the chunk, in seconds.
  pub start: f64,
  /// End of the chunk, in seconds.
  pub end: f64,
}

/// A single image frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImagePayload {
  /// Raw pixel buffer.
  pub data: Bytes,
  /// Width in pixels.
  pub width: u32,
  /// Height in pixels.
  pub height: u32,
  /// Channels per pixel.
  pub depth: u32,
  /// Pixel format tag (e.g. `rgb24`).
  pub pixel_format: String,
  /// Capture timestamp, in seconds.
  pub timestamp: f64,
}

/// An ordered sequence of frames.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoPayload {
  /// Frames in presentation order.
  pub frames: Vec<ImagePayload>,
  /// Frame rate.
  pub frames_per_second: f64,
  /// Start of the clip, in seconds.
  pub start: f64,
  /// End of the clip, in seconds.
  pub end: f64,
  /// Codec tag.
  pub codec: String,
}

impl VideoPayload {
  /// Clip duration in seconds.
  pub fn duration(&self) -> f64 {
    (self.end - self.start).max(0.0)
  }
}

/// Opaque bytes with a content type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BytesPayload {
  /// Raw content.
  pub content: Bytes,
  /// MIME type of `content`.
  pub content_type: String,
  /// Originating file name, when known.
  pub filename: Option<String>,
}

/// Open key/value object, typically intermediate text or JSON-like results.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectPayload {
  fields: Meta,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  draft: bool,
}

impl ObjectPayload {
  /// Creates a complete, empty object.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a draft object that must be populated before transmission.
  pub fn draft() -> Self {
    Self {
      fields: Meta::new(),
      draft: true,
    }
  }

  /// Creates a complete object from existing fields.
  pub fn from_fields(fields: Meta) -> Self {
    Self {
      fields,
      draft: false,
    }
  }

  /// Sets a field, returning the object for chaining.
  #[must_use]
  pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.fields.insert(key.into(), value.into());
    self
  }

  /// Sets a field.
  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
    self.fields.insert(key.into(), value.into());
  }

  /// Returns a field.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.fields.get(key)
  }

  /// All fields in insertion order.
  pub fn fields(&self) -> &Meta {
    &self.fields
  }

  /// Returns true while the object is still a draft.
  pub fn is_draft(&self) -> bool {
    self.draft
  }

  /// Marks a draft as complete.
  ///
  /// Fails when the draft has no fields yet.
  pub fn seal(&mut self) -> Result<(), DraftError> {
    if self.draft && self.fields.is_empty() {
      return Err(DraftError);
    }
    self.draft = false;
    Ok(())
  }
}

/// Returned when an empty draft is sealed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DraftError;

impl fmt::Display for DraftError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("draft payload has not been populated")
  }
}

impl std::error::Error for DraftError {}

/// A group of full messages, used for fan-in and feedback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
  /// Batched messages, in order.
  pub messages: Vec<Arc<Message>>,
  /// Batch-level metadata.
  pub metadata: Meta,
  /// Creation time of the batch.
  pub created_at: DateTime<Utc>,
  /// Unique batch identifier.
  pub batch_id: String,
  /// Number of messages in the batch.
  pub total_size: usize,
}

impl BatchPayload {
  /// Creates a batch from messages.
  pub fn new(messages: Vec<Arc<Message>>) -> Self {
    let total_size = messages.len();
    Self {
      messages,
      metadata: Meta::new(),
      created_at: Utc::now(),
      batch_id: uuid::Uuid::new_v4().to_string(),
      total_size,
    }
  }
}

/// Data carried by a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
  /// Audio samples.
  Audio(AudioPayload),
  /// Single image.
  Image(ImagePayload),
  /// Sequence of frames.
  Video(VideoPayload),
  /// Opaque bytes.
  Bytes(BytesPayload),
  /// Key/value object.
  Object(ObjectPayload),
  /// Batch of messages.
  Batch(BatchPayload),
}

impl Payload {
  /// The kind of this payload.
  pub fn kind(&self) -> PayloadKind {
    match self {
      Payload::Audio(_) => PayloadKind::Audio,
      Payload::Image(_) => PayloadKind::Image,
      Payload::Video(_) => PayloadKind::Video,
      Payload::Bytes(_) => PayloadKind::Bytes,
      Payload::Object(_) => PayloadKind::Object,
      Payload::Batch(_) => PayloadKind::Batch,
    }
  }

  /// Returns true when the payload is an unpopulated or unsealed draft.
  pub fn is_draft(&self) -> bool {
    matches!(self, Payload::Object(object) if object.is_draft())
  }

  /// Completes a draft payload; non-draft payloads are left untouched.
  pub fn seal(&mut self) -> Result<(), DraftError> {
    match self {
      Payload::Object(object) => object.seal(),
      _ => Ok(()),
    }
  }

  /// Returns the object payload, if any.
  pub fn as_object(&self) -> Option<&ObjectPayload> {
    match self {
      Payload::Object(object) => Some(object),
      _ => None,
    }
  }

  /// Returns the object payload mutably, if any.
  pub fn as_object_mut(&mut self) -> Option<&mut ObjectPayload> {
    match self {
      Payload::Object(object) => Some(object),
      _ => None,
    }
  }

  /// Returns the batch payload, if any.
  pub fn as_batch(&self) -> Option<&BatchPayload> {
    match self {
      Payload::Batch(batch) => Some(batch),
      _ => None,
    }
  }

  /// Returns the audio payload, if any.
  pub fn as_audio(&self) -> Option<&AudioPayload> {
    match self {
      Payload::Audio(audio) => Some(audio),
      _ => None,
    }
  }
}

impl From<AudioPayload> for Payload {
  fn from(p: AudioPayload) -> Self {
    Payload::Audio(p)
  }
}

impl From<ImagePayload> for Payload {
  fn from(p: ImagePayload) -> Self {
    Payload::Image(p)
  }
}

impl From<VideoPayload> for Payload {
  fn from(p: VideoPayload) -> Self {
    Payload::Video(p)
  }
}

impl From<BytesPayload> for Payload {
  fn from(p: BytesPayload) -> Self {
    Payload::Bytes(p)
  }
}

impl From<ObjectPayload> for Payload {
  fn from(p: ObjectPayload) -> Self {
    Payload::Object(p)
  }
}

impl From<BatchPayload> for Payload {
  fn from(p: BatchPayload) -> Self {
    Payload::Batch(p)
  }
}
