use crate::error::PipelineError;
use crate::manager::PipelineManager;
use crate::pipeline::{LinkSpec, NodeSpec, PipelineRequest, PipelineSpec, PipelineState};
use std::collections::HashSet;
use tempfile::TempDir;

fn request(mark: &str) -> PipelineRequest {
  let mut src = NodeSpec::new("src", "counter");
  src.configuration.insert("count", 2u64);
  PipelineRequest {
    version: "1.0".to_string(),
    plugins: Vec::new(),
    pipeline: PipelineSpec {
      name: "demo".to_string(),
      nodes: vec![src, NodeSpec::new("next", mark)],
      links: vec![LinkSpec::new("src", "next")],
    },
  }
}

fn entries(folder: &std::path::Path) -> usize {
  std::fs::read_dir(folder).map(|dir| dir.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_same_request_creates_independent_pipelines() {
  let base = TempDir::new().unwrap();
  let manager = PipelineManager::new(base.path());

  let first = manager.create_pipeline(request("passthrough")).await.unwrap();
  let second = manager.create_pipeline(request("passthrough")).await.unwrap();
  assert_ne!(first.pipeline_id, second.pipeline_id);
  assert_eq!(first.status, PipelineState::Running);
  assert_eq!(first.nodes, vec!["src", "next"]);
  assert!(first.folder.is_dir());
  assert_eq!(first.folder, base.path().join(&first.pipeline_id));
  assert_eq!(manager.list().await.len(), 2);

  let stopped = manager.stop_pipeline(&first.pipeline_id).await.unwrap();
  assert_eq!(stopped.state, PipelineState::Destroyed);
  assert_eq!(
    manager.status(&second.pipeline_id).await.unwrap().state,
    PipelineState::Running
  );
  assert!(matches!(
    manager.status(&first.pipeline_id).await,
    Err(PipelineError::UnknownPipeline(_))
  ));

  manager.shutdown().await;
  assert!(manager.is_empty().await);
}

#[tokio::test]
async fn test_failed_creation_registers_nothing() {
  let base = TempDir::new().unwrap();
  let manager = PipelineManager::new(base.path());

  let err = manager.create_pipeline(request("no_such_node")).await.unwrap_err();
  assert!(matches!(err.root(), PipelineError::NotFound { .. }));
  assert!(err.is_client_error());
  assert!(manager.is_empty().await);
  assert_eq!(entries(base.path()), 0);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_building() {
  let base = TempDir::new().unwrap();
  let manager = PipelineManager::new(base.path().join("never"));

  let mut invalid = request("passthrough");
  invalid.version.clear();
  let err = manager.create_pipeline(invalid).await.unwrap_err();
  assert!(matches!(err, PipelineError::Configuration { .. }));
  assert!(!base.path().join("never").exists());
}

#[tokio::test]
async fn test_set_base_folder_creates_and_tolerates_existing() {
  let base = TempDir::new().unwrap();
  let manager = PipelineManager::new(base.path());
  let nested = base.path().join("a").join("b");

  manager.set_base_folder(&nested).await.unwrap();
  manager.set_base_folder(&nested).await.unwrap();
  assert!(nested.is_dir());
  assert_eq!(manager.base_folder(), nested);

  let created = manager.create_pipeline(request("dump")).await.unwrap();
  assert!(created.folder.starts_with(&nested));
  manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_creation_yields_unique_identifiers() {
  let base = TempDir::new().unwrap();
  let manager = PipelineManager::new(base.path());

  let created =
    futures::future::join_all((0..8).map(|_| manager.create_pipeline(request("passthrough")))).await;
  let ids: HashSet<String> = created
    .into_iter()
    .map(|created| created.unwrap().pipeline_id)
    .collect();
  assert_eq!(ids.len(), 8);
  assert_eq!(manager.len().await, 8);
  manager.shutdown().await;
}

#[tokio::test]
async fn test_unknown_pipeline_operations_fail() {
  let base = TempDir::new().unwrap();
  let manager = PipelineManager::new(base.path());
  assert!(matches!(
    manager.stop_pipeline("missing").await,
    Err(PipelineError::UnknownPipeline(id)) if id == "missing"
  ));
}
