use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    sharder::Sharder,
    toggles::{Payload, ToggleDefinition, VariantDefinition},
    EvaluationContext,
};

/// Variant returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    /// Variant name. [`Variant::DISABLED_NAME`] for the disabled variant.
    pub name: String,
    /// Payload attached to the variant, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    /// `false` only for the disabled variant (or a caller default that says so).
    pub enabled: bool,
}

impl Variant {
    /// Name of the variant returned when the toggle is disabled or has no variants.
    pub const DISABLED_NAME: &'static str = "disabled";

    /// The default variant: returned when the toggle is disabled, unknown, or has no variants.
    pub fn disabled() -> Variant {
        Variant {
            name: Self::DISABLED_NAME.to_owned(),
            payload: None,
            enabled: false,
        }
    }

    fn from_definition(definition: &VariantDefinition) -> Variant {
        Variant {
            name: definition.name.clone(),
            payload: definition.payload.clone(),
            enabled: true,
        }
    }
}

impl Default for Variant {
    fn default() -> Self {
        Variant::disabled()
    }
}

/// Salt that keeps variant hashing independent from rollout hashing on the same identity.
const VARIANT_SALT: &str = "variant";

/// Pick a variant of `toggle` for `context`. The caller is responsible for checking that the
/// toggle is enabled.
pub(crate) fn select_variant(
    toggle: &ToggleDefinition,
    context: &EvaluationContext,
    default_variant: &Variant,
    sharder: &impl Sharder,
) -> Variant {
    if toggle.variants.is_empty() {
        return default_variant.clone();
    }

    if let Some(forced) = find_override(&toggle.variants, context) {
        return Variant::from_definition(forced);
    }

    let total_weight: u64 = toggle.variants.iter().map(|v| u64::from(v.weight)).sum();
    if total_weight == 0 {
        return default_variant.clone();
    }

    let stickiness = stickiness_value(toggle.variant_stickiness(), context);
    let cursor = sharder.get_shard(
        &format!("{VARIANT_SALT}:{}:{stickiness}", toggle.name),
        total_weight,
    );

    let mut upper_bound = 0;
    for variant in &toggle.variants {
        upper_bound += u64::from(variant.weight);
        if cursor < upper_bound {
            return Variant::from_definition(variant);
        }
    }

    // Unreachable as long as `cursor < total_weight`.
    default_variant.clone()
}

fn find_override<'a>(
    variants: &'a [VariantDefinition],
    context: &EvaluationContext,
) -> Option<&'a VariantDefinition> {
    variants.iter().find(|variant| {
        variant.overrides.iter().any(|rule| {
            context
                .get(&rule.context_name)
                .is_some_and(|value| rule.values.iter().any(|v| *v == *value))
        })
    })
}

/// Value used to pin an identity to a variant: the configured field, then session id, then user
/// id. Falls back to a random value, which makes assignment non-sticky.
fn stickiness_value(stickiness: Option<&str>, context: &EvaluationContext) -> String {
    if let Some(value) = stickiness.and_then(|field| context.get(field)) {
        return value.into_owned();
    }

    context
        .session_id
        .as_ref()
        .or(context.user_id.as_ref())
        .cloned()
        .unwrap_or_else(|| thread_rng().gen::<u64>().to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{select_variant, Variant};
    use crate::{
        sharder::{DeterministicSharder, Md5Sharder},
        toggles::{Payload, ToggleDefinition, VariantDefinition, VariantOverride},
        EvaluationContext,
    };

    fn toggle(variants: Vec<VariantDefinition>) -> ToggleDefinition {
        ToggleDefinition::new("checkout", true).with_variants(variants)
    }

    #[test]
    fn no_variants_returns_default() {
        let default = Variant {
            name: "fallback".to_owned(),
            payload: None,
            enabled: true,
        };
        let selected = select_variant(
            &toggle(vec![]),
            &EvaluationContext::new(),
            &default,
            &Md5Sharder,
        );
        assert_eq!(selected, default);
    }

    #[test]
    fn zero_total_weight_returns_default() {
        let selected = select_variant(
            &toggle(vec![VariantDefinition::new("a", 0), VariantDefinition::new("b", 0)]),
            &EvaluationContext::new().with_user_id("u1"),
            &Variant::disabled(),
            &Md5Sharder,
        );
        assert_eq!(selected, Variant::disabled());
    }

    #[test]
    fn walks_weights_in_declaration_order() {
        let toggle = toggle(vec![
            VariantDefinition::new("a", 1),
            VariantDefinition::new("zero", 0),
            VariantDefinition::new("b", 2),
        ]);
        let sharder = DeterministicSharder(HashMap::from([
            ("variant:checkout:s0".to_owned(), 0),
            ("variant:checkout:s1".to_owned(), 1),
            ("variant:checkout:s2".to_owned(), 2),
        ]));

        let pick = |session: &str| {
            select_variant(
                &toggle,
                &EvaluationContext::new().with_session_id(session),
                &Variant::disabled(),
                &sharder,
            )
            .name
        };
        assert_eq!(pick("s0"), "a");
        assert_eq!(pick("s1"), "b");
        assert_eq!(pick("s2"), "b");
    }

    #[test]
    fn selection_is_deterministic() {
        let toggle = toggle(vec![
            VariantDefinition::new("red", 50),
            VariantDefinition::new("blue", 50),
        ]);
        let ctx = EvaluationContext::new().with_user_id("u1");
        let first = select_variant(&toggle, &ctx, &Variant::disabled(), &Md5Sharder);
        for _ in 0..20 {
            assert_eq!(
                select_variant(&toggle, &ctx, &Variant::disabled(), &Md5Sharder),
                first
            );
        }
    }

    #[test]
    fn distribution_follows_weights() {
        let toggle = toggle(vec![
            VariantDefinition::new("small", 1),
            VariantDefinition::new("large", 3),
        ]);

        let n = 20_000;
        let small = (0..n)
            .filter(|i| {
                let ctx = EvaluationContext::new().with_user_id(format!("user-{i}"));
                select_variant(&toggle, &ctx, &Variant::disabled(), &Md5Sharder).name == "small"
            })
            .count();

        let ratio = small as f64 / n as f64;
        assert!((ratio - 0.25).abs() < 0.02, "small ratio {ratio}");
    }

    #[test]
    fn stickiness_field_pins_assignment() {
        let toggle = toggle(vec![
            VariantDefinition::new("red", 50).with_stickiness("tenant"),
            VariantDefinition::new("blue", 50).with_stickiness("tenant"),
        ]);

        let base = EvaluationContext::new().with_property("tenant", "acme");
        let expected = select_variant(&toggle, &base, &Variant::disabled(), &Md5Sharder);
        for i in 0..20 {
            let ctx = base.clone().with_session_id(format!("s{i}"));
            assert_eq!(
                select_variant(&toggle, &ctx, &Variant::disabled(), &Md5Sharder),
                expected
            );
        }
    }

    #[test]
    fn override_bypasses_hash() {
        let toggle = toggle(vec![
            VariantDefinition::new("a", 100),
            VariantDefinition::new("b", 0)
                .with_payload(Payload {
                    payload_type: "string".to_owned(),
                    value: "forced".to_owned(),
                })
                .with_override(VariantOverride {
                    context_name: "userId".to_owned(),
                    values: vec!["vip".to_owned()],
                }),
        ]);

        let selected = select_variant(
            &toggle,
            &EvaluationContext::new().with_user_id("vip"),
            &Variant::disabled(),
            &Md5Sharder,
        );
        assert_eq!(selected.name, "b");
        assert_eq!(selected.payload.unwrap().value, "forced");
        assert!(selected.enabled);
    }
}
