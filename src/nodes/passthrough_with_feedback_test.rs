use super::passthrough_with_feedback::PassthroughWithFeedback;
use crate::message::Message;
use crate::node::{InputBatch, InputQueue, Node, NodeContext, NodeIdentity};
use crate::payload::ObjectPayload;
use crate::synchroniser::Passthrough;
use crate::value::Config;
use std::sync::Arc;

struct Wiring {
  ctx: NodeContext,
  downstream: Arc<InputQueue>,
  upstream: Arc<InputQueue>,
}

fn wiring() -> Wiring {
  let downstream = Arc::new(InputQueue::new("out", ["fb"], None));
  let upstream = Arc::new(InputQueue::new("src", ["fb"], None));
  let ctx = NodeContext::new(
    NodeIdentity {
      name: "fb".to_string(),
      pipe_name: "test".to_string(),
    },
    std::env::temp_dir(),
  )
  .with_origins(["src"])
  .with_link("out", "fb", Arc::clone(&downstream))
  .with_feedback_route("src", "fb", Arc::clone(&upstream));
  Wiring {
    ctx,
    downstream,
    upstream,
  }
}

fn input(version: u64) -> Arc<Message> {
  Arc::new(Message::new("src", version, ObjectPayload::new().with("index", version)))
}

async fn node(delay_ms: u64) -> PassthroughWithFeedback {
  let wiring = wiring();
  let mut node = PassthroughWithFeedback::new(Config::new().with("delay_ms", delay_ms));
  node.configure(&wiring.ctx).await.unwrap();
  node
}

#[tokio::test]
async fn test_one_output_and_one_feedback_per_input() {
  let Wiring {
    ctx,
    downstream,
    upstream,
  } = wiring();
  let mut node = node(0).await;

  for version in 0..3 {
    node
      .update(InputBatch::single_from("src", input(version)), &ctx)
      .await
      .unwrap();
  }

  assert_eq!(node.transmitted(), 3);
  assert_eq!(downstream.pending(), 3);
  assert_eq!(upstream.pending(), 3);

  let feedback = upstream.take_batch(&Passthrough).unwrap().unwrap();
  for (index, (origin, message)) in feedback.iter().enumerate() {
    assert_eq!(origin, "fb");
    let routing = message.feedback().unwrap();
    assert_eq!(routing.target, "src");
    assert_eq!(routing.message.version(), index as u64);
  }
}

#[tokio::test]
async fn test_output_combines_input_with_prior_feedback() {
  let Wiring {
    ctx, downstream, ..
  } = wiring();
  let mut node = node(0).await;

  ctx.record_feedback(&input(100));
  node
    .update(InputBatch::single_from("src", input(0)), &ctx)
    .await
    .unwrap();
  node
    .update(InputBatch::single_from("src", input(1)), &ctx)
    .await
    .unwrap();

  let out = downstream.take_batch(&Passthrough).unwrap().unwrap();
  let sizes: Vec<usize> = out
    .from_origin("fb")
    .iter()
    .map(|message| message.payload().as_batch().unwrap().total_size)
    .collect();
  assert_eq!(sizes, vec![2, 1]);

  let first = out.from_origin("fb")[0].payload().as_batch().unwrap();
  assert_eq!(first.messages[0].version(), 0);
  assert_eq!(first.messages[1].version(), 100);
}

#[tokio::test]
async fn test_delay_is_timed() {
  let Wiring {
    ctx, downstream, ..
  } = wiring();
  let mut node = node(5).await;
  node
    .update(InputBatch::single_from("src", input(0)), &ctx)
    .await
    .unwrap();

  let out = downstream.take_batch(&Passthrough).unwrap().unwrap();
  let delay = out.from_origin("fb")[0].timers().get("fb_delay").unwrap();
  assert!(delay >= 0.005);
}
