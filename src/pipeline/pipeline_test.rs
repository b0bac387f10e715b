use super::*;
use crate::error::NodeError;
use crate::node::{InputBatch, Node};
use crate::payload::ObjectPayload;
use crate::plugin::{NodeRegistry, PluginLoader};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Hooks {
  warmups: AtomicU64,
  stops: AtomicU64,
  destroys: AtomicU64,
  log: Mutex<Vec<String>>,
}

struct Tracked {
  name: String,
  hooks: Arc<Hooks>,
  fail_warmup: bool,
}

#[async_trait]
impl Node for Tracked {
  async fn warmup(&mut self, _ctx: &NodeContext) -> Result<(), NodeError> {
    if self.fail_warmup {
      return Err("device unavailable".into());
    }
    self.hooks.warmups.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn update(&mut self, _batch: InputBatch, _ctx: &NodeContext) -> Result<(), NodeError> {
    Ok(())
  }

  async fn stop(&mut self) -> Result<(), NodeError> {
    self.hooks.stops.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn destroy(&mut self) -> Result<(), NodeError> {
    self.hooks.destroys.fetch_add(1, Ordering::SeqCst);
    self.hooks.log.lock().unwrap().push(self.name.clone());
    Ok(())
  }
}

fn resolver(hooks: &Arc<Hooks>) -> NodeResolver {
  let mut registry = NodeRegistry::with_builtins();
  for (mark, fail_warmup) in [("tracked", false), ("fragile", true)] {
    let hooks = Arc::clone(hooks);
    registry.register(
      mark,
      Arc::new(move |options: NodeOptions| -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(Tracked {
          name: options.name,
          hooks: Arc::clone(&hooks),
          fail_warmup,
        }))
      }),
    );
  }
  NodeResolver::new(registry, PluginLoader::default())
}

fn request(nodes: Vec<NodeSpec>, links: Vec<LinkSpec>) -> PipelineRequest {
  PipelineRequest {
    version: "1.0".to_string(),
    plugins: Vec::new(),
    pipeline: PipelineSpec {
      name: "test".to_string(),
      nodes,
      links,
    },
  }
}

fn feedback_link(from: &str, to: &str) -> LinkSpec {
  LinkSpec {
    feedback: true,
    ..LinkSpec::new(from, to)
  }
}

#[tokio::test]
async fn test_build_runs_and_tears_down() {
  let folder = tempfile::tempdir().unwrap();
  let hooks = Arc::new(Hooks::default());
  let mut src = NodeSpec::new("src", "counter");
  src.kind = NodeKind::Source;
  src.configuration.insert("count", 3u64);
  let request = request(
    vec![
      NodeSpec::new("out", "dump"),
      NodeSpec::new("fb", "passthrough_with_feedback"),
      src,
    ],
    vec![
      LinkSpec::new("src", "fb"),
      LinkSpec::new("fb", "out"),
      feedback_link("fb", "src"),
    ],
  );

  let mut pipeline = Pipeline::build(
    "p1",
    &request,
    folder.path(),
    &resolver(&hooks),
    &SynchroniserRegistry::with_builtins(),
  )
  .await
  .unwrap();
  assert_eq!(pipeline.state(), PipelineState::Ready);
  assert_eq!(pipeline.node_names(), vec!["src", "fb", "out"]);
  assert_eq!(pipeline.node_state("fb"), Some(NodeState::WarmedUp));
  assert_eq!(pipeline.sources(), 1);
  assert_eq!(pipeline.downstream("fb").len(), 1);

  pipeline.start().unwrap();
  assert!(pipeline.start().is_err());
  tokio::time::timeout(Duration::from_secs(5), pipeline.wait_idle(Duration::from_millis(10)))
    .await
    .unwrap();

  let report = pipeline.report();
  assert!(report.nodes.iter().all(|node| node.failures == 0 && node.pending == 0));
  assert!(report.nodes.iter().all(|node| node.processed > 0));
  let dumps = std::fs::read_dir(folder.path()).unwrap().count();
  assert_eq!(dumps, 3);

  pipeline.stop().await;
  assert_eq!(pipeline.node_state("src"), Some(NodeState::Stopped));
  pipeline.destroy().await;
  pipeline.destroy().await;
  assert_eq!(pipeline.state(), PipelineState::Destroyed);
  assert_eq!(pipeline.node_state("out"), Some(NodeState::Destroyed));
}

#[tokio::test]
async fn test_warmup_failure_releases_built_nodes() {
  let folder = tempfile::tempdir().unwrap();
  let hooks = Arc::new(Hooks::default());
  let request = request(
    vec![
      NodeSpec::new("first", "tracked"),
      NodeSpec::new("second", "tracked"),
      NodeSpec::new("broken", "fragile"),
    ],
    vec![
      LinkSpec::new("first", "second"),
      LinkSpec::new("second", "broken"),
    ],
  );

  let err = Pipeline::build(
    "p2",
    &request,
    folder.path(),
    &resolver(&hooks),
    &SynchroniserRegistry::with_builtins(),
  )
  .await
  .unwrap_err();

  match &err {
    PipelineError::Build { node, .. } => assert_eq!(node, "broken"),
    other => panic!("unexpected error: {other:?}"),
  }
  assert!(err.to_string().contains("device unavailable"));
  assert_eq!(hooks.warmups.load(Ordering::SeqCst), 2);
  assert_eq!(hooks.stops.load(Ordering::SeqCst), 2);
  assert_eq!(hooks.destroys.load(Ordering::SeqCst), 2);
  assert_eq!(*hooks.log.lock().unwrap(), vec!["second", "first"]);
}

#[tokio::test]
async fn test_unknown_synchroniser_is_a_configuration_error() {
  let folder = tempfile::tempdir().unwrap();
  let hooks = Arc::new(Hooks::default());
  let mut node = NodeSpec::new("a", "tracked");
  node.sync = Some("windowed".to_string());
  let request = request(vec![NodeSpec::new("ok", "tracked"), node], Vec::new());

  let err = Pipeline::build(
    "p3",
    &request,
    folder.path(),
    &resolver(&hooks),
    &SynchroniserRegistry::with_builtins(),
  )
  .await
  .unwrap_err();

  assert!(matches!(err.root(), PipelineError::Configuration { .. }));
  assert!(err.is_client_error());
  assert!(err.to_string().contains("windowed"));
  assert_eq!(hooks.destroys.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_mark_is_not_found() {
  let folder = tempfile::tempdir().unwrap();
  let hooks = Arc::new(Hooks::default());
  let request = request(vec![NodeSpec::new("a", "missing_node")], Vec::new());

  let err = Pipeline::build(
    "p4",
    &request,
    folder.path(),
    &resolver(&hooks),
    &SynchroniserRegistry::with_builtins(),
  )
  .await
  .unwrap_err();

  assert!(matches!(err.root(), PipelineError::NotFound { .. }));
}

#[tokio::test]
async fn test_deliver_reaches_declared_origin_only() {
  let folder = tempfile::tempdir().unwrap();
  let hooks = Arc::new(Hooks::default());
  let request = request(
    vec![NodeSpec::new("a", "tracked"), NodeSpec::new("b", "tracked")],
    vec![LinkSpec::new("a", "b")],
  );
  let pipeline = Pipeline::build(
    "p5",
    &request,
    folder.path(),
    &resolver(&hooks),
    &SynchroniserRegistry::with_builtins(),
  )
  .await
  .unwrap();

  let message = || Message::new("outside", 0, ObjectPayload::new().with("k", 1u64));
  assert_eq!(pipeline.deliver("b", "a", message()).unwrap(), Delivery::Queued);
  assert_eq!(
    pipeline.deliver("b", "elsewhere", message()).unwrap(),
    Delivery::UnknownOrigin
  );
  assert!(pipeline.deliver("c", "a", message()).is_err());
  assert_eq!(pipeline.report().nodes[1].pending, 1);
}
