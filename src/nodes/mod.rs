//! # Bundled Nodes
//!
//! Small node implementations registered in the built-in registry under their
//! module name. They are meant for demos, smoke tests and as reference
//! implementations of the node contract.
//!
//! | Mark                        | Kind   | Behaviour                                    |
//! |-----------------------------|--------|----------------------------------------------|
//! | `counter`                   | source | emits `count` objects `{index}`              |
//! | `passthrough`               | proc   | re-emits every input under its own name      |
//! | `passthrough_with_feedback` | proc   | batches input with feedback, sends feedback  |
//! | `dump`                      | sink   | writes every input as JSON to the pipeline folder |

pub mod counter;
pub mod dump;
pub mod passthrough;
pub mod passthrough_with_feedback;

#[cfg(test)]
mod passthrough_with_feedback_test;
