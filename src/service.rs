//! # Remote Service
//!
//! HTTP front end of a [`PipelineManager`].
//!
//! | Method   | Path              | Action                                  |
//! |----------|-------------------|-----------------------------------------|
//! | `POST`   | `/process`        | create a pipeline from a JSON request   |
//! | `GET`    | `/pipelines`      | list running pipelines                  |
//! | `GET`    | `/pipelines/{id}` | report one pipeline                     |
//! | `DELETE` | `/pipelines/{id}` | stop, destroy and unregister a pipeline |
//!
//! Failures are answered with `{"error": <kind>, "message": <description>}`:
//! 400 when the request is at fault (invalid specification, unknown node type,
//! missing plugin folder or entry point), 404 for an unknown pipeline
//! identifier and 500 for load, build and internal failures.

use crate::error::PipelineError;
use crate::manager::PipelineManager;
use crate::pipeline::PipelineRequest;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Serialize)]
struct ErrorBody<'a> {
  error: &'a str,
  message: String,
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
  match serde_json::to_vec(body) {
    Ok(bytes) => Response::builder()
      .status(status)
      .header(header::CONTENT_TYPE, "application/json")
      .body(Full::new(Bytes::from(bytes)))
      .unwrap_or_else(|_| plain_error()),
    Err(err) => {
      error!(error = %err, "failed to encode response");
      plain_error()
    }
  }
}

fn plain_error() -> Response<Full<Bytes>> {
  let mut response = Response::new(Full::new(Bytes::from_static(b"internal error")));
  *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
  response
}

fn status_of(err: &PipelineError) -> StatusCode {
  match err.root() {
    PipelineError::UnknownPipeline(_) => StatusCode::NOT_FOUND,
    _ if err.is_client_error() => StatusCode::BAD_REQUEST,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

/// Converts an error into its JSON response.
pub fn error_response(err: &PipelineError) -> Response<Full<Bytes>> {
  json_response(
    status_of(err),
    &ErrorBody {
      error: err.kind(),
      message: err.to_string(),
    },
  )
}

fn route_error(status: StatusCode, kind: &str, message: String) -> Response<Full<Bytes>> {
  json_response(status, &ErrorBody { error: kind, message })
}

/// Answers one request.
pub async fn handle<B>(request: Request<B>, manager: &PipelineManager) -> Response<Full<Bytes>>
where
  B: Body,
  B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
  let method = request.method().clone();
  let path = request.uri().path().trim_end_matches('/').to_string();
  debug!(method = %method, path = %path, "request");

  let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
  let outcome = match (&method, segments.as_slice()) {
    (&Method::POST, ["process"]) => {
      let body = match Limited::new(request.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
          return route_error(
            StatusCode::BAD_REQUEST,
            "invalid_body",
            format!("cannot read request body: {err}"),
          );
        }
      };
      match PipelineRequest::from_json(&body) {
        Ok(pipeline) => manager
          .create_pipeline(pipeline)
          .await
          .map(|created| json_response(StatusCode::OK, &created)),
        Err(err) => Err(err),
      }
    }
    (&Method::GET, ["pipelines"]) => Ok(json_response(StatusCode::OK, &manager.list().await)),
    (&Method::GET, ["pipelines", id]) => manager
      .status(id)
      .await
      .map(|report| json_response(StatusCode::OK, &report)),
    (&Method::DELETE, ["pipelines", id]) => manager
      .stop_pipeline(id)
      .await
      .map(|report| json_response(StatusCode::OK, &report)),
    (_, ["process"]) | (_, ["pipelines"]) | (_, ["pipelines", _]) => {
      return route_error(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        format!("{method} is not supported on {path}"),
      );
    }
    _ => {
      return route_error(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("no route for {method} {path}"),
      );
    }
  };

  outcome.unwrap_or_else(|err| {
    if status_of(&err).is_server_error() {
      error!(method = %method, path = %path, kind = err.kind(), error = %err, "request failed");
    } else {
      warn!(method = %method, path = %path, kind = err.kind(), error = %err, "request rejected");
    }
    error_response(&err)
  })
}

/// Serves `manager` on `listener` until `shutdown` resolves, then tears every
/// pipeline down.
pub async fn serve(
  listener: TcpListener,
  manager: Arc<PipelineManager>,
  shutdown: impl Future<Output = ()>,
) -> Result<(), PipelineError> {
  let address = listener.local_addr()?;
  info!(address = %address, "pipeline service listening");
  tokio::pin!(shutdown);

  loop {
    let (stream, peer) = tokio::select! {
      _ = &mut shutdown => break,
      accepted = listener.accept() => match accepted {
        Ok(accepted) => accepted,
        Err(err) => {
          warn!(error = %err, "failed to accept connection");
          continue;
        }
      },
    };

    let manager = Arc::clone(&manager);
    tokio::spawn(async move {
      let service = service_fn(move |request| {
        let manager = Arc::clone(&manager);
        async move { Ok::<_, Infallible>(handle(request, &manager).await) }
      });
      if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
      {
        debug!(peer = %peer, error = %err, "connection closed with error");
      }
    });
  }

  info!("pipeline service stopping");
  manager.shutdown().await;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use http_body_util::Empty;
  use serde_json::Value;

  async fn call(manager: &PipelineManager, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
    let request = Request::builder()
      .method(method)
      .uri(uri)
      .body(Full::new(Bytes::from(body.to_string())))
      .unwrap();
    let response = handle(request, manager).await;
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
  }

  const REQUEST: &str = r#"{
    "version": "1.0",
    "pipeline": {
      "name": "remote",
      "nodes": [
        {"name": "src", "type": "source", "mark": "counter", "configuration": {"count": 1}},
        {"name": "out", "type": "sink", "mark": "passthrough"}
      ],
      "links": [{"from": "src", "to": "out"}]
    }
  }"#;

  #[tokio::test]
  async fn test_create_list_and_delete() {
    let base = tempfile::tempdir().unwrap();
    let manager = PipelineManager::new(base.path());

    let (status, created) = call(&manager, Method::POST, "/process", REQUEST).await;
    assert_eq!(status, StatusCode::OK);
    let id = created["pipeline_id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "running");
    assert_eq!(created["nodes"], serde_json::json!(["src", "out"]));

    let (status, listed) = call(&manager, Method::GET, "/pipelines", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, report) = call(&manager, Method::GET, &format!("/pipelines/{id}"), "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["name"], "remote");

    let (status, report) = call(&manager, Method::DELETE, &format!("/pipelines/{id}/"), "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["state"], "destroyed");

    let (status, body) = call(&manager, Method::GET, &format!("/pipelines/{id}"), "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_pipeline");
  }

  #[tokio::test]
  async fn test_client_failures_are_bad_requests() {
    let base = tempfile::tempdir().unwrap();
    let manager = PipelineManager::new(base.path());

    let (status, body) = call(&manager, Method::POST, "/process", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "configuration_error");

    let unknown = REQUEST.replace("\"passthrough\"", "\"missing_mark\"");
    let (status, body) = call(&manager, Method::POST, "/process", &unknown).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "build_error");
    assert!(body["message"].as_str().unwrap().contains("missing_mark"));
  }

  #[tokio::test]
  async fn test_unknown_routes() {
    let base = tempfile::tempdir().unwrap();
    let manager = PipelineManager::new(base.path());

    let request = Request::builder()
      .method(Method::PUT)
      .uri("/process")
      .body(Empty::<Bytes>::new())
      .unwrap();
    assert_eq!(handle(request, &manager).await.status(), StatusCode::METHOD_NOT_ALLOWED);

    let (status, body) = call(&manager, Method::GET, "/elsewhere", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
  }
}
