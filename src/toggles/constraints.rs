//! Constraint resolution (inline + segment constraints) and constraint evaluation.
use chrono::{DateTime, Utc};
use semver::Version;

use crate::{
    toggles::{ActivationStrategy, Constraint, Operator, SegmentId, ToggleCollection},
    EvaluationContext,
};

/// A constraint that applies to a strategy after segment references have been expanded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedConstraint<'a> {
    /// A constraint that exists in the collection, either inline or inherited from a segment.
    Constraint(&'a Constraint),
    /// Placeholder for a segment reference that does not resolve in the collection. Never
    /// satisfied, so a dangling reference can't widen access.
    MissingSegment(SegmentId),
}

impl ResolvedConstraint<'_> {
    /// Evaluate against `context`. A missing segment is never satisfied.
    pub fn is_satisfied(&self, context: &EvaluationContext) -> bool {
        match self {
            ResolvedConstraint::Constraint(constraint) => constraint.is_satisfied(context),
            ResolvedConstraint::MissingSegment(_) => false,
        }
    }
}

/// Expand `strategy` constraints against `collection`: segment constraints first (in reference
/// order), inline constraints after.
pub fn resolve_constraints<'a>(
    strategy: &'a ActivationStrategy,
    collection: &'a ToggleCollection,
) -> Vec<ResolvedConstraint<'a>> {
    let mut resolved = Vec::with_capacity(strategy.constraints.len() + strategy.segments.len());

    for &segment_id in &strategy.segments {
        match collection.segment(segment_id) {
            Some(segment) => resolved.extend(
                segment
                    .constraints
                    .iter()
                    .map(ResolvedConstraint::Constraint),
            ),
            None => {
                log::debug!(target: "flagwise",
                            strategy:display = strategy.name,
                            segment_id;
                            "strategy references a segment missing from the collection");
                resolved.push(ResolvedConstraint::MissingSegment(segment_id));
            }
        }
    }

    resolved.extend(
        strategy
            .constraints
            .iter()
            .map(ResolvedConstraint::Constraint),
    );
    resolved
}

impl Constraint {
    /// Evaluate the constraint against `context`.
    ///
    /// Operands or context values that cannot be parsed for the operator make the constraint
    /// unsatisfied, regardless of `inverted`.
    pub fn is_satisfied(&self, context: &EvaluationContext) -> bool {
        match self.try_eval(context) {
            Some(result) => result != self.inverted,
            None => false,
        }
    }

    /// Try applying the operator, returning `None` if it cannot be applied.
    fn try_eval(&self, context: &EvaluationContext) -> Option<bool> {
        let field = context.get(&self.context_name);

        match self.operator {
            Operator::In | Operator::NotIn => {
                let is_in = field.is_some_and(|value| {
                    let value = value.trim();
                    self.values
                        .iter()
                        .any(|candidate| self.str_eq(candidate, value))
                });
                Some(is_in == (self.operator == Operator::In))
            }

            Operator::StrContains | Operator::StrStartsWith | Operator::StrEndsWith => {
                let value = self.fold_case(&field?);
                Some(self.values.iter().any(|candidate| {
                    let candidate = self.fold_case(candidate);
                    match self.operator {
                        Operator::StrContains => value.contains(candidate.as_str()),
                        Operator::StrStartsWith => value.starts_with(candidate.as_str()),
                        _ => value.ends_with(candidate.as_str()),
                    }
                }))
            }

            Operator::NumEq
            | Operator::NumGt
            | Operator::NumGte
            | Operator::NumLt
            | Operator::NumLte => {
                let operand: f64 = self.operand()?.trim().parse().ok()?;
                let value: f64 = field?.trim().parse().ok()?;
                Some(match self.operator {
                    Operator::NumEq => value == operand,
                    Operator::NumGt => value > operand,
                    Operator::NumGte => value >= operand,
                    Operator::NumLt => value < operand,
                    _ => value <= operand,
                })
            }

            Operator::DateAfter | Operator::DateBefore => {
                let operand = parse_date(self.operand()?)?;
                let value = match field {
                    Some(value) => parse_date(&value)?,
                    None if self.context_name == EvaluationContext::CURRENT_TIME => Utc::now(),
                    None => return None,
                };
                Some(if self.operator == Operator::DateAfter {
                    value > operand
                } else {
                    value < operand
                })
            }

            Operator::SemverEq | Operator::SemverGt | Operator::SemverLt => {
                let operand = Version::parse(self.operand()?.trim()).ok()?;
                let value = Version::parse(field?.trim()).ok()?;
                Some(match self.operator {
                    Operator::SemverEq => value == operand,
                    Operator::SemverGt => value > operand,
                    _ => value < operand,
                })
            }

            Operator::Unknown => None,
        }
    }

    /// Single operand of scalar operators. Falls back to the first of `values`.
    fn operand(&self) -> Option<&str> {
        self.value
            .as_deref()
            .or_else(|| self.values.first().map(String::as_str))
    }

    fn str_eq(&self, a: &str, b: &str) -> bool {
        if self.case_insensitive {
            a.to_lowercase() == b.to_lowercase()
        } else {
            a == b
        }
    }

    fn fold_case(&self, s: &str) -> String {
        if self.case_insensitive {
            s.to_lowercase()
        } else {
            s.to_owned()
        }
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
