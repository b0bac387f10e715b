//! Failure handling for running nodes.
//!
//! A failure inside `start` or `update` is contained at the node boundary: it
//! is reported and the configured [`FailurePolicy`] decides whether the node
//! keeps processing. Sibling nodes are never affected. A panic always stops
//! the failing node.

use crate::error::PipelineError;
use crate::value::Config;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Report of a contained node failure.
#[derive(Clone, Debug)]
pub struct FailureReport {
  /// Node that failed.
  pub node: String,
  /// Error description.
  pub error: String,
  /// Failures of this node so far, this one included.
  pub count: u64,
  /// The failure was a panic.
  pub panicked: bool,
}

/// What to do after a failed `update`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
  /// Log the failure and process the next batch.
  #[default]
  Continue,
  /// Move the node to `failed` and stop accepting input.
  Stop,
}

impl FromStr for FailureAction {
  type Err = PipelineError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value {
      "continue" => Ok(FailureAction::Continue),
      "stop" => Ok(FailureAction::Stop),
      other => Err(PipelineError::configuration(
        "option 'on_failure'",
        format!("expected 'continue' or 'stop', found '{other}'"),
      )),
    }
  }
}

impl fmt::Display for FailureAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FailureAction::Continue => f.write_str("continue"),
      FailureAction::Stop => f.write_str("stop"),
    }
  }
}

/// Per-node failure policy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FailurePolicy {
  /// Action for an ordinary error.
  pub on_failure: FailureAction,
  /// Failures tolerated under `Continue` before the node is stopped anyway.
  /// `None` tolerates any number.
  pub max_failures: Option<u64>,
}

impl FailurePolicy {
  /// Creates a policy with the given action and no failure limit.
  pub fn new(on_failure: FailureAction) -> Self {
    Self {
      on_failure,
      max_failures: None,
    }
  }

  /// Sets the failure limit.
  #[must_use]
  pub fn with_max_failures(mut self, max_failures: Option<u64>) -> Self {
    self.max_failures = max_failures;
    self
  }

  /// Reads `on_failure` and `max_failures` from node configuration.
  pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
    let on_failure = config.str_or("on_failure", "continue")?.parse()?;
    let max_failures = match config.get("max_failures") {
      None => None,
      Some(_) => Some(config.u64_or("max_failures", 0)?),
    };
    Ok(Self {
      on_failure,
      max_failures,
    })
  }

  /// Decides the action for a failure.
  pub fn decide(&self, report: &FailureReport) -> FailureAction {
    if report.panicked {
      return FailureAction::Stop;
    }
    match (self.on_failure, self.max_failures) {
      (FailureAction::Continue, Some(max)) if report.count >= max => FailureAction::Stop,
      (action, _) => action,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn report(count: u64, panicked: bool) -> FailureReport {
    FailureReport {
      node: "n".to_string(),
      error: "boom".to_string(),
      count,
      panicked,
    }
  }

  #[test]
  fn test_default_policy_continues() {
    let policy = FailurePolicy::default();
    assert_eq!(policy.decide(&report(10, false)), FailureAction::Continue);
    assert_eq!(policy.decide(&report(1, true)), FailureAction::Stop);
  }

  #[test]
  fn test_failure_limit_stops() {
    let policy = FailurePolicy::new(FailureAction::Continue).with_max_failures(Some(2));
    assert_eq!(policy.decide(&report(1, false)), FailureAction::Continue);
    assert_eq!(policy.decide(&report(2, false)), FailureAction::Stop);
  }

  #[test]
  fn test_policy_from_config() {
    let config = Config::new().with("on_failure", "stop");
    assert_eq!(
      FailurePolicy::from_config(&config).unwrap().on_failure,
      FailureAction::Stop
    );

    let config = Config::new().with("max_failures", 3);
    assert_eq!(
      FailurePolicy::from_config(&config).unwrap().max_failures,
      Some(3)
    );

    let config = Config::new().with("on_failure", "retry");
    assert!(FailurePolicy::from_config(&config).is_err());
  }
}
