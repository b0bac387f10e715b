//! # Tributary
//!
//! Node-based streaming pipelines in pure Rust.
//!
//! A pipeline is a graph of [`Node`](node::Node)s. Each node runs in its own
//! task, buffers its input per upstream origin, lets a
//! [`Synchroniser`](synchroniser::Synchroniser) decide which buffered
//! messages form the next batch, and transmits [`Message`]s downstream.
//! Messages may carry feedback routing that sends them back to an upstream
//! node.
//!
//! ## Key Features
//!
//! - **Declarative pipelines**: nodes and links described in JSON, validated
//!   and wired by [`Pipeline::build`](pipeline::Pipeline::build)
//! - **Multi-source alignment**: pluggable synchroniser policies per node
//! - **Feedback routing**: downstream nodes can address messages to upstream
//!   nodes without creating build-time cycles
//! - **Plugins**: node implementations loaded from plugin folders, either
//!   native libraries or units linked into the host
//! - **Failure isolation**: a failing node never takes its siblings down
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), tributary::PipelineError> {
//! use tributary::manager::PipelineManager;
//! use tributary::pipeline::PipelineRequest;
//!
//! let manager = PipelineManager::new("./running_pipelines");
//! let request = PipelineRequest::from_json(br#"{
//!   "version": "1.0",
//!   "pipeline": {
//!     "name": "demo",
//!     "nodes": [
//!       {"name": "src", "type": "source", "mark": "counter", "configuration": {"count": 3}},
//!       {"name": "fb", "mark": "passthrough_with_feedback"},
//!       {"name": "out", "type": "sink", "mark": "dump"}
//!     ],
//!     "links": [
//!       {"from": "src", "to": "fb"},
//!       {"from": "fb", "to": "out"},
//!       {"from": "fb", "to": "src", "feedback": true}
//!     ]
//!   }
//! }"#)?;
//! let created = manager.create_pipeline(request).await?;
//! println!("running {}", created.pipeline_id);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

/// Service configuration file.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Tracing subscriber setup.
pub mod logging;
/// Registry of running pipelines.
pub mod manager;
/// Messages, timers and version counters.
pub mod message;
/// Node trait, context, buffers and runtime.
pub mod node;
/// Bundled node implementations.
pub mod nodes;
/// Payload kinds carried by messages.
pub mod payload;
/// Pipeline specification, build and execution.
pub mod pipeline;
/// Plugin folders and artifact loading.
pub mod plugin;
/// HTTP front end of the manager.
pub mod service;
/// Batch selection policies.
pub mod synchroniser;
/// Typed metadata and configuration values.
pub mod value;

#[cfg(test)]
mod manager_test;

pub use error::{NodeError, PipelineError};
pub use message::{Feedback, Message, Timers, VersionCounter};
pub use payload::{
  AudioPayload, BatchPayload, BytesPayload, ImagePayload, ObjectPayload, Payload, PayloadKind,
  VideoPayload,
};
pub use value::{Config, Meta, Value};
