//! # Synchronisers
//!
//! Policies deciding which buffered inputs form a node's next processing unit.
//!
//! A synchroniser sees, for every origin a node declares, the indices of the
//! messages currently waiting in that origin's buffer, and answers with the
//! indices to consume now. It never touches the buffers itself: the node
//! runtime validates the answer, removes the selected messages and calls the
//! node's `update` once per decision. Messages that are not selected stay
//! buffered in arrival order.
//!
//! ## Built-in policies
//!
//! - [`Passthrough`] (`passthrough`): drain every buffer completely
//! - [`OnePerOrigin`] (`one_per_origin`): barrier that waits until every
//!   origin has a message, then takes the oldest from each
//!
//! Policies are looked up by name in a [`SynchroniserRegistry`].

use crate::error::PipelineError;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Pending message indices per declared origin, in declaration order.
///
/// Every declared origin is present, including origins with nothing buffered.
pub type SourceView = IndexMap<String, Vec<usize>>;

/// Indices to consume now, per origin.
pub type Selection = IndexMap<String, Vec<usize>>;

/// Builds a [`SourceView`] from per-origin buffer lengths.
pub fn source_view<S: Into<String>>(lengths: impl IntoIterator<Item = (S, usize)>) -> SourceView {
  lengths
    .into_iter()
    .map(|(origin, len)| (origin.into(), (0..len).collect()))
    .collect()
}

/// A pure selection policy over per-origin buffers.
pub trait Synchroniser: Send + Sync + fmt::Debug {
  /// Registry name of the policy.
  fn name(&self) -> &str;

  /// Decides which pending indices to consume now.
  ///
  /// Returning an empty selection (or only empty index lists) means "wait".
  fn next_batch(&self, sources: &SourceView) -> Selection;
}

/// Consumes everything currently buffered, from every origin, in arrival order.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

impl Synchroniser for Passthrough {
  fn name(&self) -> &str {
    "passthrough"
  }

  fn next_batch(&self, sources: &SourceView) -> Selection {
    sources
      .iter()
      .map(|(origin, pending)| (origin.clone(), pending.clone()))
      .collect()
  }
}

/// Barrier policy: once every origin has a pending message, take the oldest
/// one from each.
#[derive(Clone, Copy, Debug, Default)]
pub struct OnePerOrigin;

impl Synchroniser for OnePerOrigin {
  fn name(&self) -> &str {
    "one_per_origin"
  }

  fn next_batch(&self, sources: &SourceView) -> Selection {
    if sources.is_empty() || sources.values().any(Vec::is_empty) {
      return Selection::new();
    }
    sources
      .iter()
      .map(|(origin, pending)| (origin.clone(), pending[..1].to_vec()))
      .collect()
  }
}

/// Reasons a decision is rejected by the runtime.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidSelection {
  /// The decision names an origin the node did not declare.
  #[error("origin '{0}' is not declared")]
  UnknownOrigin(String),
  /// An index does not point into the origin's buffer.
  #[error("index {index} is out of range for origin '{origin}' ({len} pending)")]
  OutOfRange {
    /// Offending origin.
    origin: String,
    /// Offending index.
    index: usize,
    /// Pending messages for the origin.
    len: usize,
  },
  /// The same index was selected twice.
  #[error("index {index} selected twice for origin '{origin}'")]
  Duplicate {
    /// Offending origin.
    origin: String,
    /// Duplicated index.
    index: usize,
  },
}

/// Checks a decision against the view it was computed from.
pub fn validate_selection(sources: &SourceView, selection: &Selection) -> Result<(), InvalidSelection> {
  for (origin, indices) in selection {
    let pending = sources
      .get(origin)
      .ok_or_else(|| InvalidSelection::UnknownOrigin(origin.clone()))?;
    let mut seen = HashSet::with_capacity(indices.len());
    for &index in indices {
      if index >= pending.len() {
        return Err(InvalidSelection::OutOfRange {
          origin: origin.clone(),
          index,
          len: pending.len(),
        });
      }
      if !seen.insert(index) {
        return Err(InvalidSelection::Duplicate {
          origin: origin.clone(),
          index,
        });
      }
    }
  }
  Ok(())
}

/// Returns true when a decision selects nothing.
pub fn is_empty_selection(selection: &Selection) -> bool {
  selection.values().all(Vec::is_empty)
}

/// Named synchroniser policies.
#[derive(Clone)]
pub struct SynchroniserRegistry {
  entries: BTreeMap<String, Arc<dyn Synchroniser>>,
}

impl SynchroniserRegistry {
  /// Creates a registry without any policy.
  pub fn empty() -> Self {
    Self {
      entries: BTreeMap::new(),
    }
  }

  /// Creates a registry holding the built-in policies.
  pub fn with_builtins() -> Self {
    let mut registry = Self::empty();
    registry.register(Arc::new(Passthrough));
    registry.register(Arc::new(OnePerOrigin));
    registry
  }

  /// Registers a policy under its own name, replacing any previous one.
  pub fn register(&mut self, synchroniser: Arc<dyn Synchroniser>) {
    self
      .entries
      .insert(synchroniser.name().to_string(), synchroniser);
  }

  /// Looks a policy up.
  pub fn get(&self, name: &str) -> Option<Arc<dyn Synchroniser>> {
    self.entries.get(name).cloned()
  }

  /// Looks a policy up, failing with a configuration error naming `scope`.
  pub fn resolve(&self, name: &str, scope: &str) -> Result<Arc<dyn Synchroniser>, PipelineError> {
    self.get(name).ok_or_else(|| {
      PipelineError::configuration(
        scope,
        format!(
          "unknown synchroniser '{name}' (known: {})",
          self.names().join(", ")
        ),
      )
    })
  }

  /// Registered names, sorted.
  pub fn names(&self) -> Vec<String> {
    self.entries.keys().cloned().collect()
  }
}

impl Default for SynchroniserRegistry {
  fn default() -> Self {
    Self::with_builtins()
  }
}

impl fmt::Debug for SynchroniserRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SynchroniserRegistry")
      .field("names", &self.names())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn selection(entries: &[(&str, &[usize])]) -> Selection {
    entries
      .iter()
      .map(|(origin, indices)| (origin.to_string(), indices.to_vec()))
      .collect()
  }

  #[test]
  fn test_passthrough_drains_everything() {
    let view = source_view([("A", 2), ("B", 1)]);
    let decision = Passthrough.next_batch(&view);
    assert_eq!(decision, selection(&[("A", &[0, 1]), ("B", &[0])]));

    let empty = source_view([("A", 0), ("B", 0)]);
    let decision = Passthrough.next_batch(&empty);
    assert_eq!(decision, selection(&[("A", &[]), ("B", &[])]));
    assert!(is_empty_selection(&decision));
  }

  #[test]
  fn test_one_per_origin_waits_for_every_origin() {
    let view = source_view([("A", 2), ("B", 0)]);
    assert!(is_empty_selection(&OnePerOrigin.next_batch(&view)));

    let view = source_view([("A", 2), ("B", 3)]);
    assert_eq!(
      OnePerOrigin.next_batch(&view),
      selection(&[("A", &[0]), ("B", &[0])])
    );
  }

  #[test]
  fn test_one_per_origin_without_origins_waits() {
    assert!(OnePerOrigin.next_batch(&SourceView::new()).is_empty());
  }

  #[test]
  fn test_validate_selection_rejects_bad_decisions() {
    let view = source_view([("A", 2)]);
    assert!(validate_selection(&view, &selection(&[("A", &[1, 0])])).is_ok());
    assert_eq!(
      validate_selection(&view, &selection(&[("Z", &[0])])),
      Err(InvalidSelection::UnknownOrigin("Z".to_string()))
    );
    assert!(matches!(
      validate_selection(&view, &selection(&[("A", &[2])])),
      Err(InvalidSelection::OutOfRange { index: 2, len: 2, .. })
    ));
    assert!(matches!(
      validate_selection(&view, &selection(&[("A", &[1, 1])])),
      Err(InvalidSelection::Duplicate { index: 1, .. })
    ));
  }

  #[test]
  fn test_registry_resolution() {
    let registry = SynchroniserRegistry::with_builtins();
    assert_eq!(registry.names(), vec!["one_per_origin", "passthrough"]);
    assert_eq!(
      registry.resolve("passthrough", "node 'a'").unwrap().name(),
      "passthrough"
    );

    let err = registry.resolve("lockstep", "node 'a'").unwrap_err();
    assert!(matches!(err, PipelineError::Configuration { .. }));
    assert!(err.to_string().contains("lockstep"));
  }
}
