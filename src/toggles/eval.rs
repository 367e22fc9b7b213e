use serde::Serialize;

use crate::{
    sharder::Sharder,
    toggles::{
        constraints::resolve_constraints, strategies::StrategyRegistry, ActivationStrategy,
        ToggleCollection, ToggleDefinition,
    },
    EvaluationContext,
};

/// Why an [`Evaluation`] came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationReason {
    /// Toggle is not in the collection; the caller's default was used.
    UnknownToggle,
    /// Toggle is globally disabled.
    Disabled,
    /// Toggle is enabled and has no strategies: on for everyone.
    NoStrategies,
    /// A strategy (see [`Evaluation::matched_strategy`]) was satisfied.
    StrategyMatched,
    /// No strategy was satisfied.
    NoStrategyMatched,
}

/// Result of evaluating a toggle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// Whether the toggle is enabled for the context.
    pub enabled: bool,
    /// Name of the first satisfied strategy.
    pub matched_strategy: Option<String>,
    /// Diagnostic reason.
    pub reason: EvaluationReason,
}

impl Evaluation {
    fn new(enabled: bool, reason: EvaluationReason) -> Evaluation {
        Evaluation {
            enabled,
            matched_strategy: None,
            reason,
        }
    }
}

/// Decide whether `toggle_name` is enabled for `context`.
///
/// This is a pure function of its inputs (apart from random-stickiness strategies). It doesn't
/// record metrics or emit events.
pub(crate) fn evaluate(
    collection: &ToggleCollection,
    strategies: &StrategyRegistry,
    toggle_name: &str,
    context: &EvaluationContext,
    default_enabled: bool,
    sharder: &impl Sharder,
) -> Evaluation {
    let Some(toggle) = collection.toggle(toggle_name) else {
        return Evaluation::new(default_enabled, EvaluationReason::UnknownToggle);
    };

    evaluate_toggle(collection, strategies, toggle, context, sharder)
}

pub(crate) fn evaluate_toggle(
    collection: &ToggleCollection,
    strategies: &StrategyRegistry,
    toggle: &ToggleDefinition,
    context: &EvaluationContext,
    sharder: &impl Sharder,
) -> Evaluation {
    if !toggle.enabled {
        return Evaluation::new(false, EvaluationReason::Disabled);
    }

    if toggle.strategies.is_empty() {
        return Evaluation::new(true, EvaluationReason::NoStrategies);
    }

    let matched = toggle.strategies.iter().find(|strategy| {
        is_strategy_satisfied(collection, strategies, strategy, context, sharder)
    });

    match matched {
        Some(strategy) => Evaluation {
            enabled: true,
            matched_strategy: Some(strategy.name.clone()),
            reason: EvaluationReason::StrategyMatched,
        },
        None => Evaluation::new(false, EvaluationReason::NoStrategyMatched),
    }
}

/// A strategy is satisfied when all of its effective constraints hold and its predicate holds.
fn is_strategy_satisfied(
    collection: &ToggleCollection,
    strategies: &StrategyRegistry,
    strategy: &ActivationStrategy,
    context: &EvaluationContext,
    sharder: &impl Sharder,
) -> bool {
    let constraints_hold = resolve_constraints(strategy, collection)
        .iter()
        .all(|constraint| constraint.is_satisfied(context));

    constraints_hold
        && strategies
            .lookup(&strategy.name)
            .is_enabled(&strategy.parameters, context, sharder)
}

#[cfg(test)]
mod tests {
    use super::{evaluate, EvaluationReason};
    use crate::{
        sharder::Md5Sharder,
        toggles::{
            strategies::StrategyRegistry, ActivationStrategy, Constraint, Operator, Segment,
            ToggleCollection, ToggleDefinition,
        },
        EvaluationContext,
    };

    fn contexts() -> Vec<EvaluationContext> {
        vec![
            EvaluationContext::new(),
            EvaluationContext::new().with_user_id("u1"),
            EvaluationContext::new()
                .with_session_id("s1")
                .with_remote_address("10.0.0.1"),
            EvaluationContext::new().with_property("tenant", "acme"),
        ]
    }

    fn eval(collection: &ToggleCollection, name: &str, ctx: &EvaluationContext) -> super::Evaluation {
        evaluate(
            collection,
            &StrategyRegistry::default(),
            name,
            ctx,
            false,
            &Md5Sharder,
        )
    }

    #[test]
    fn unknown_toggle_uses_default() {
        let collection = ToggleCollection::default();
        let ctx = EvaluationContext::new();

        let result = evaluate(
            &collection,
            &StrategyRegistry::default(),
            "missing",
            &ctx,
            true,
            &Md5Sharder,
        );
        assert!(result.enabled);
        assert_eq!(result.reason, EvaluationReason::UnknownToggle);
        assert!(!eval(&collection, "missing", &ctx).enabled);
    }

    #[test]
    fn enabled_without_strategies_is_on_for_everyone() {
        let collection = ToggleCollection::new([ToggleDefinition::new("new-search", true)], []);
        for ctx in contexts() {
            let result = eval(&collection, "new-search", &ctx);
            assert!(result.enabled);
            assert_eq!(result.reason, EvaluationReason::NoStrategies);
        }
    }

    #[test]
    fn disabled_is_off_regardless_of_strategies() {
        let collection = ToggleCollection::new(
            [ToggleDefinition::new("off", false).with_strategy(ActivationStrategy::new("default"))],
            [],
        );
        for ctx in contexts() {
            let result = eval(&collection, "off", &ctx);
            assert!(!result.enabled);
            assert_eq!(result.reason, EvaluationReason::Disabled);
        }
    }

    #[test]
    fn strategies_are_ored_and_first_match_is_reported() {
        let collection = ToggleCollection::new(
            [ToggleDefinition::new("t", true)
                .with_strategy(
                    ActivationStrategy::new("userWithId").with_parameter("userIds", "alice"),
                )
                .with_strategy(ActivationStrategy::new("default"))],
            [],
        );

        let alice = eval(&collection, "t", &EvaluationContext::new().with_user_id("alice"));
        assert!(alice.enabled);
        assert_eq!(alice.matched_strategy.as_deref(), Some("userWithId"));

        let bob = eval(&collection, "t", &EvaluationContext::new().with_user_id("bob"));
        assert!(bob.enabled);
        assert_eq!(bob.matched_strategy.as_deref(), Some("default"));
    }

    #[test]
    fn constraints_gate_the_strategy() {
        let collection = ToggleCollection::new(
            [ToggleDefinition::new("t", true).with_strategy(
                ActivationStrategy::new("default").with_constraint(Constraint::new(
                    "environment",
                    Operator::In,
                    ["prod"],
                )),
            )],
            [],
        );

        assert!(eval(&collection, "t", &EvaluationContext::new().with_environment("prod")).enabled);
        let dev = eval(&collection, "t", &EvaluationContext::new().with_environment("dev"));
        assert!(!dev.enabled);
        assert_eq!(dev.reason, EvaluationReason::NoStrategyMatched);
    }

    #[test]
    fn segment_constraints_apply() {
        let collection = ToggleCollection::new(
            [ToggleDefinition::new("t", true)
                .with_strategy(ActivationStrategy::new("default").with_segment(3))],
            [Segment::new(
                3,
                vec![Constraint::new("tenant", Operator::In, ["acme"])],
            )],
        );

        let acme = EvaluationContext::new().with_property("tenant", "acme");
        let other = EvaluationContext::new().with_property("tenant", "globex");
        assert!(eval(&collection, "t", &acme).enabled);
        assert!(!eval(&collection, "t", &other).enabled);
    }

    #[test]
    fn dangling_segment_fails_closed() {
        let collection = ToggleCollection::new(
            [ToggleDefinition::new("t", true)
                .with_strategy(ActivationStrategy::new("default").with_segment(404))],
            [],
        );
        for ctx in contexts() {
            assert!(!eval(&collection, "t", &ctx).enabled);
        }
    }

    #[test]
    fn unknown_strategy_is_not_satisfied() {
        let collection = ToggleCollection::new(
            [ToggleDefinition::new("t", true)
                .with_strategy(ActivationStrategy::new("fromTheFuture"))],
            [],
        );
        for ctx in contexts() {
            assert!(!eval(&collection, "t", &ctx).enabled);
        }
    }

    #[test]
    fn gradual_rollout_is_stable_for_a_user() {
        let collection = ToggleCollection::new(
            [ToggleDefinition::new("beta-ui", true).with_strategy(
                ActivationStrategy::new("gradualRolloutUserId")
                    .with_parameter("percentage", "50")
                    .with_parameter("groupId", "beta-ui"),
            )],
            [],
        );

        let u1 = EvaluationContext::new().with_user_id("u1");
        let first = eval(&collection, "beta-ui", &u1).enabled;
        for _ in 0..10 {
            assert_eq!(eval(&collection, "beta-ui", &u1).enabled, first);
        }
    }
}
