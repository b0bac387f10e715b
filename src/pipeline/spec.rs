//! Declarative pipeline specification and its validation.

use crate::error::PipelineError;
use crate::node::NodeKind;
use crate::value::Config;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;

/// A pipeline creation request.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PipelineRequest {
  /// Specification format version.
  pub version: String,
  /// Roots searched for plugin folders.
  #[serde(default)]
  pub plugins: Vec<PathBuf>,
  /// The pipeline itself.
  pub pipeline: PipelineSpec,
}

impl PipelineRequest {
  /// Parses a JSON request.
  pub fn from_json(bytes: &[u8]) -> Result<Self, PipelineError> {
    serde_json::from_slice(bytes).map_err(|err| PipelineError::configuration("pipeline request", err.to_string()))
  }
}

/// Nodes and links of a pipeline.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PipelineSpec {
  /// Pipeline name.
  pub name: String,
  /// Node entries, in declaration order.
  #[serde(default)]
  pub nodes: Vec<NodeSpec>,
  /// Directed links between nodes.
  #[serde(default)]
  pub links: Vec<LinkSpec>,
}

/// One node entry.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeSpec {
  /// Node name, unique within the pipeline.
  pub name: String,
  /// Declared role.
  #[serde(rename = "type", default)]
  pub kind: NodeKind,
  /// Implementation reference: built-in name or plugin folder name.
  pub mark: String,
  /// Options overriding the implementation defaults.
  #[serde(default)]
  pub configuration: Config,
  /// Synchroniser name.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sync: Option<String>,
  /// Explicit plugin folder.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub remote: Option<PathBuf>,
  /// Bound of each origin buffer; unbounded when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub buffer_capacity: Option<usize>,
}

impl NodeSpec {
  /// Creates an entry with an empty configuration.
  pub fn new(name: impl Into<String>, mark: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      kind: NodeKind::default(),
      mark: mark.into(),
      configuration: Config::new(),
      sync: None,
      remote: None,
      buffer_capacity: None,
    }
  }
}

/// A directed link from producer to consumer.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LinkSpec {
  /// Producer node.
  pub from: String,
  /// Consumer node.
  pub to: String,
  /// Origin name the consumer sees; defaults to the producer name.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub origin: Option<String>,
  /// Feedback route instead of an ordinary connection.
  #[serde(default)]
  pub feedback: bool,
}

impl LinkSpec {
  /// Creates an ordinary link.
  pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
    Self {
      from: from.into(),
      to: to.into(),
      origin: None,
      feedback: false,
    }
  }

  /// Origin name the consumer sees.
  pub fn origin(&self) -> &str {
    self.origin.as_deref().unwrap_or(&self.from)
  }
}

/// A connection resolved from a link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Route {
  /// Consumer node.
  pub to: String,
  /// Origin on the consumer.
  pub origin: String,
}

/// Validated wiring of a pipeline.
#[derive(Clone, Debug, Default)]
pub struct GraphPlan {
  /// Node names in dependency order (feedback links excluded).
  pub order: Vec<String>,
  /// Declared origins per node, in link order.
  pub origins: IndexMap<String, Vec<String>>,
  /// Ordinary connections per producer.
  pub routes: IndexMap<String, Vec<Route>>,
  /// Feedback routes per producer.
  pub feedback: IndexMap<String, Vec<Route>>,
}

fn invalid(scope: &str, reason: impl Into<String>) -> PipelineError {
  PipelineError::configuration(scope, reason)
}

impl PipelineRequest {
  /// Validates the request and computes its wiring.
  ///
  /// Rejects an empty version, duplicate node names, links to unknown nodes,
  /// duplicate origins on a consumer and cycles among ordinary links.
  pub fn plan(&self) -> Result<GraphPlan, PipelineError> {
    if self.version.trim().is_empty() {
      return Err(invalid("field 'version'", "must not be empty"));
    }
    self.pipeline.plan()
  }
}

impl PipelineSpec {
  /// Validates the graph and computes its wiring.
  pub fn plan(&self) -> Result<GraphPlan, PipelineError> {
    if self.name.trim().is_empty() {
      return Err(invalid("field 'pipeline.name'", "must not be empty"));
    }

    let mut names = IndexSet::new();
    for node in &self.nodes {
      if node.name.trim().is_empty() {
        return Err(invalid("field 'pipeline.nodes'", "node names must not be empty"));
      }
      if node.mark.trim().is_empty() && node.remote.is_none() {
        return Err(invalid(&format!("node '{}'", node.name), "field 'mark' must not be empty"));
      }
      if !names.insert(node.name.as_str()) {
        return Err(invalid(
          "field 'pipeline.nodes'",
          format!("duplicate node name '{}'", node.name),
        ));
      }
    }

    let mut plan = GraphPlan {
      order: Vec::with_capacity(names.len()),
      origins: names.iter().map(|name| (name.to_string(), Vec::new())).collect(),
      routes: IndexMap::new(),
      feedback: IndexMap::new(),
    };

    for link in &self.links {
      let scope = format!("link '{}' -> '{}'", link.from, link.to);
      for end in [&link.from, &link.to] {
        if !names.contains(end.as_str()) {
          return Err(invalid(&scope, format!("unknown node '{end}'")));
        }
      }
      let origin = link.origin().to_string();
      let declared = plan.origins.entry(link.to.clone()).or_default();
      if declared.contains(&origin) {
        return Err(invalid(
          &scope,
          format!("origin '{origin}' is already declared on '{}'", link.to),
        ));
      }
      declared.push(origin.clone());

      let routes = if link.feedback {
        &mut plan.feedback
      } else {
        &mut plan.routes
      };
      routes.entry(link.from.clone()).or_default().push(Route {
        to: link.to.clone(),
        origin,
      });
    }

    plan.order = topological_order(&names, &plan.routes)?;
    Ok(plan)
  }
}

/// Kahn's algorithm over ordinary links; ties keep declaration order.
fn topological_order(
  names: &IndexSet<&str>,
  routes: &IndexMap<String, Vec<Route>>,
) -> Result<Vec<String>, PipelineError> {
  let mut in_degree: IndexMap<&str, usize> = names.iter().map(|name| (*name, 0)).collect();
  for route in routes.values().flatten() {
    if let Some(degree) = in_degree.get_mut(route.to.as_str()) {
      *degree += 1;
    }
  }

  let mut ready: VecDeque<&str> = in_degree
    .iter()
    .filter(|(_, degree)| **degree == 0)
    .map(|(name, _)| *name)
    .collect();
  let mut order = Vec::with_capacity(names.len());
  while let Some(name) = ready.pop_front() {
    order.push(name.to_string());
    for route in routes.get(name).into_iter().flatten() {
      if let Some(degree) = in_degree.get_mut(route.to.as_str()) {
        *degree -= 1;
        if *degree == 0 {
          ready.push_back(route.to.as_str());
        }
      }
    }
  }

  if order.len() != names.len() {
    let cyclic: Vec<_> = in_degree
      .iter()
      .filter(|(_, degree)| **degree > 0)
      .map(|(name, _)| *name)
      .collect();
    return Err(invalid(
      "field 'pipeline.links'",
      format!("cycle among non-feedback links involving {}", cyclic.join(", ")),
    ));
  }
  Ok(order)
}
