//! Re-emits every input message under the node's own name.

use crate::error::NodeError;
use crate::message::Message;
use crate::node::{InputBatch, Node, NodeContext, NodeOptions};
use async_trait::async_trait;

/// Identity transform.
pub struct Passthrough;

/// Factory registered as `passthrough`.
pub fn build(_options: NodeOptions) -> Result<Box<dyn Node>, NodeError> {
  Ok(Box::new(Passthrough))
}

#[async_trait]
impl Node for Passthrough {
  async fn update(&mut self, batch: InputBatch, ctx: &NodeContext) -> Result<(), NodeError> {
    for (_, message) in batch.iter() {
      let out = Message::new(ctx.name(), ctx.next_version(), message.payload().clone())
        .with_meta_from(message)
        .with_timers_from(message);
      ctx.transmit(out)?;
    }
    Ok(())
  }
}
