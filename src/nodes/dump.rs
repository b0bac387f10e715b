//! Sink writing every received message as pretty JSON into the pipeline
//! folder, as `<name>_<n>.json` where `n` counts the dumped messages.

use crate::error::NodeError;
use crate::node::{InputBatch, Node, NodeContext, NodeOptions};
use crate::payload::PayloadKind;
use async_trait::async_trait;
use tracing::debug;

/// JSON dump sink.
pub struct Dump {
  dumped: u64,
}

/// Factory registered as `dump`.
pub fn build(_options: NodeOptions) -> Result<Box<dyn Node>, NodeError> {
  Ok(Box::new(Dump { dumped: 0 }))
}

#[async_trait]
impl Node for Dump {
  async fn update(&mut self, batch: InputBatch, ctx: &NodeContext) -> Result<(), NodeError> {
    for (origin, message) in batch.iter() {
      let file_name = format!("{}_{}.json", ctx.name(), ctx.next_version());
      let path = ctx.dump_json(&**message, &file_name).await?;
      self.dumped += 1;
      debug!(
        node = %ctx.name(),
        origin = %origin,
        path = %path.display(),
        dumped = self.dumped,
        "message dumped"
      );
    }
    Ok(())
  }

  fn produces(&self) -> &[PayloadKind] {
    &[]
  }
}
