//! # Passthrough With Feedback
//!
//! For every received message, transmits one message whose batch payload
//! holds the input followed by the feedback previously received from the
//! input's creator. The outbound message carries feedback routing back to
//! that creator, referencing the input.
//!
//! ## Options
//!
//! - `delay_ms` (default 0): wait before transmitting, recorded on the
//!   outbound message under `<name>_delay`

use crate::error::NodeError;
use crate::message::Message;
use crate::node::{InputBatch, Node, NodeContext, NodeOptions};
use crate::payload::{BatchPayload, PayloadKind};
use crate::synchroniser::{Passthrough, Synchroniser};
use crate::value::Config;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Feedback demo node.
pub struct PassthroughWithFeedback {
  config: Config,
  delay: Duration,
  transmitted: u64,
}

/// Factory registered as `passthrough_with_feedback`.
pub fn build(options: NodeOptions) -> Result<Box<dyn Node>, NodeError> {
  Ok(Box::new(PassthroughWithFeedback::new(options.config)))
}

impl PassthroughWithFeedback {
  /// Unconfigured node reading its options from `config`.
  pub fn new(config: Config) -> Self {
    Self {
      config,
      delay: Duration::ZERO,
      transmitted: 0,
    }
  }

  /// Messages transmitted so far.
  pub fn transmitted(&self) -> u64 {
    self.transmitted
  }
}

#[async_trait]
impl Node for PassthroughWithFeedback {
  async fn configure(&mut self, _ctx: &NodeContext) -> Result<(), NodeError> {
    self.delay = Duration::from_millis(self.config.u64_or("delay_ms", 0)?);
    Ok(())
  }

  async fn update(&mut self, batch: InputBatch, ctx: &NodeContext) -> Result<(), NodeError> {
    for (_, input) in batch.iter() {
      let creator = input.creator().to_string();
      let feedbacks = ctx.pick_feedback(&creator);
      debug!(
        node = %ctx.name(),
        creator = %creator,
        version = input.version(),
        feedbacks = feedbacks.len(),
        "augmenting message"
      );

      let mut messages = Vec::with_capacity(feedbacks.len() + 1);
      messages.push(Arc::clone(input));
      messages.extend(feedbacks);

      let mut out = Message::new(ctx.name(), ctx.next_version(), BatchPayload::new(messages))
        .with_meta_from(input)
        .with_timers_from(input)
        .with_feedback(Arc::clone(input), creator);
      {
        let _delay = out.timeit(format!("{}_delay", ctx.name()));
        if !self.delay.is_zero() {
          tokio::time::sleep(self.delay).await;
        }
      }

      ctx.transmit(out)?;
      self.transmitted += 1;
    }
    Ok(())
  }

  fn synchroniser(&self) -> Option<Arc<dyn Synchroniser>> {
    Some(Arc::new(Passthrough))
  }

  fn produces(&self) -> &[PayloadKind] {
    &[PayloadKind::Batch]
  }
}
