//! Native plugin with one node, `Echo`, that re-emits its input tagged with
//! a label after an optional delay.
//!
//! Options: `label` (default `"echo"`), `delay_ms` (default 0) and `panic`
//! (default false; panics in `update`, to exercise failure containment).
//!
//! Build with `cargo build -p echo-plugin --release`, then copy
//! `config.toml` and the library into a folder named `echo`:
//!
//! ```text
//! plugins/echo/
//! ├── config.toml
//! └── libecho.so
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use tributary::node::{InputBatch, Node, NodeContext, NodeOptions};
use tributary::{Message, NodeError};

tributary::export_plugin! {
  "Echo" => build,
}

struct Echo {
  label: String,
  delay: Duration,
  panic: bool,
}

fn build(options: NodeOptions) -> Result<Box<dyn Node>, NodeError> {
  Ok(Box::new(Echo {
    label: options.config.str_or("label", "echo")?,
    delay: Duration::from_millis(options.config.u64_or("delay_ms", 0)?),
    panic: options.config.bool_or("panic", false)?,
  }))
}

#[async_trait]
impl Node for Echo {
  async fn update(&mut self, batch: InputBatch, ctx: &NodeContext) -> Result<(), NodeError> {
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    if self.panic {
      panic!("echo asked to panic");
    }
    for (origin, message) in batch.iter() {
      debug!(node = %ctx.name(), origin, version = message.version(), "echo");
      let out = Message::new(ctx.name(), ctx.next_version(), message.payload().clone())
        .with_meta_from(message)
        .with_timers_from(message)
        .with_meta("label", self.label.clone());
      ctx.transmit(out)?;
    }
    Ok(())
  }
}
