//! Toggle definitions and their evaluation.
//!
//! [`ToggleCollection`] is the immutable snapshot of every toggle and segment the client knows
//! about. Evaluation resolves strategy constraints against the same snapshot, so a segment
//! reference never crosses snapshots.
mod constraints;
mod eval;
mod models;
pub mod strategies;
mod variants;

pub use constraints::{resolve_constraints, ResolvedConstraint};
pub use eval::{Evaluation, EvaluationReason};
pub use models::*;
pub use variants::Variant;

pub(crate) use eval::{evaluate, evaluate_toggle};
pub(crate) use variants::select_variant;
