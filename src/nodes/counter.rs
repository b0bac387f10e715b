//! # Counter Node
//!
//! Source emitting `count` object messages `{index}`, one every
//! `interval_ms` milliseconds.
//!
//! ## Options
//!
//! - `count` (default 10)
//! - `interval_ms` (default 0)
//!
//! Feedback addressed to the counter is accepted on any declared origin and
//! only logged.

use crate::error::NodeError;
use crate::message::Message;
use crate::node::{InputBatch, Node, NodeContext, NodeOptions};
use crate::payload::{ObjectPayload, PayloadKind};
use crate::value::Config;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Numbered object source.
pub struct Counter {
  config: Config,
  count: u64,
  interval: Duration,
  emitted: u64,
}

/// Factory registered as `counter`.
pub fn build(options: NodeOptions) -> Result<Box<dyn Node>, NodeError> {
  Ok(Box::new(Counter {
    config: options.config,
    count: 0,
    interval: Duration::ZERO,
    emitted: 0,
  }))
}

#[async_trait]
impl Node for Counter {
  async fn configure(&mut self, _ctx: &NodeContext) -> Result<(), NodeError> {
    self.count = self.config.u64_or("count", 10)?;
    self.interval = Duration::from_millis(self.config.u64_or("interval_ms", 0)?);
    Ok(())
  }

  async fn start(&mut self, ctx: &NodeContext) -> Result<(), NodeError> {
    for index in 0..self.count {
      if ctx.is_stopping() {
        break;
      }
      let message = Message::new(
        ctx.name(),
        ctx.next_version(),
        ObjectPayload::new().with("index", index),
      );
      ctx.transmit(message)?;
      self.emitted += 1;

      if !self.interval.is_zero() {
        tokio::select! {
          _ = ctx.cancelled() => break,
          _ = tokio::time::sleep(self.interval) => {}
        }
      }
    }
    info!(node = %ctx.name(), emitted = self.emitted, "counter finished");
    Ok(())
  }

  async fn update(&mut self, batch: InputBatch, ctx: &NodeContext) -> Result<(), NodeError> {
    for (origin, message) in batch.iter() {
      debug!(
        node = %ctx.name(),
        origin = %origin,
        version = message.version(),
        feedback = message.feedback().is_some(),
        "counter received"
      );
    }
    Ok(())
  }

  fn accepts(&self) -> &[PayloadKind] {
    &[]
  }

  fn produces(&self) -> &[PayloadKind] {
    &[PayloadKind::Object]
  }
}
