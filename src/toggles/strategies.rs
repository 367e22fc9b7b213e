//! Activation strategies.
//!
//! Built-in strategies are a closed set resolved by name. Names registered through
//! [`ClientConfig::strategy()`](crate::ClientConfig::strategy) resolve to custom strategies and
//! everything else resolves to [`StrategyKind::Unknown`], which is never satisfied.
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Arc,
};

use rand::{thread_rng, Rng};

use crate::{
    sharder::{normalized_hash, Sharder},
    EvaluationContext,
};

/// A user-defined activation strategy.
///
/// ```
/// # use flagwise::{ClientConfig, EvaluationContext};
/// # use std::collections::HashMap;
/// let config = ClientConfig::new("my-app").strategy(
///     "betaTesters",
///     |_parameters: &HashMap<String, String>, context: &EvaluationContext| {
///         context.properties.get("beta").is_some_and(|v| v == "true")
///     },
/// );
/// ```
pub trait Strategy {
    /// Return `true` if the strategy is satisfied for `context`.
    ///
    /// Constraints attached to the strategy are checked separately and must not be evaluated here.
    fn is_enabled(&self, parameters: &HashMap<String, String>, context: &EvaluationContext)
        -> bool;
}

impl<T: Fn(&HashMap<String, String>, &EvaluationContext) -> bool> Strategy for T {
    fn is_enabled(
        &self,
        parameters: &HashMap<String, String>,
        context: &EvaluationContext,
    ) -> bool {
        self(parameters, context)
    }
}

pub(crate) type SharedStrategy = Arc<dyn Strategy + Send + Sync>;

/// On for everyone.
pub const DEFAULT: &str = "default";
/// On for the user ids listed in the `userIds` parameter.
pub const USER_WITH_ID: &str = "userWithId";
/// Percentage rollout on user id.
pub const GRADUAL_ROLLOUT_USER_ID: &str = "gradualRolloutUserId";
/// Percentage rollout on session id.
pub const GRADUAL_ROLLOUT_SESSION_ID: &str = "gradualRolloutSessionId";
/// Random percentage rollout. Not sticky.
pub const GRADUAL_ROLLOUT_RANDOM: &str = "gradualRolloutRandom";
/// On for the hosts listed in the `hostNames` parameter.
pub const APPLICATION_HOSTNAME: &str = "applicationHostname";
/// On for the addresses and CIDR ranges listed in the `IPs` parameter.
pub const REMOTE_ADDRESS: &str = "remoteAddress";
/// Percentage rollout on a configurable stickiness field.
pub const FLEXIBLE_ROLLOUT: &str = "flexibleRollout";

/// Names of built-in strategies. These cannot be overridden by custom strategies.
pub const BUILTIN_STRATEGIES: &[&str] = &[
    DEFAULT,
    USER_WITH_ID,
    GRADUAL_ROLLOUT_USER_ID,
    GRADUAL_ROLLOUT_SESSION_ID,
    GRADUAL_ROLLOUT_RANDOM,
    APPLICATION_HOSTNAME,
    REMOTE_ADDRESS,
    FLEXIBLE_ROLLOUT,
];

/// A strategy resolved from its name.
#[derive(Clone)]
pub(crate) enum StrategyKind<'a> {
    Default,
    UserWithId,
    GradualRolloutUserId,
    GradualRolloutSessionId,
    GradualRolloutRandom,
    ApplicationHostname { hostname: &'a str },
    RemoteAddress,
    FlexibleRollout,
    Custom(&'a (dyn Strategy + Send + Sync)),
    Unknown,
}

/// Resolves strategy names into [`StrategyKind`]s.
pub(crate) struct StrategyRegistry {
    custom: HashMap<String, SharedStrategy>,
    hostname: String,
}

impl StrategyRegistry {
    pub(crate) fn new(custom: HashMap<String, SharedStrategy>, hostname: String) -> Self {
        StrategyRegistry { custom, hostname }
    }

    /// Hostname from the `HOSTNAME` (or `COMPUTERNAME`) environment variable.
    pub(crate) fn local_hostname() -> String {
        std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "undefined".to_owned())
    }

    pub(crate) fn lookup(&self, name: &str) -> StrategyKind<'_> {
        match name {
            DEFAULT => StrategyKind::Default,
            USER_WITH_ID => StrategyKind::UserWithId,
            GRADUAL_ROLLOUT_USER_ID => StrategyKind::GradualRolloutUserId,
            GRADUAL_ROLLOUT_SESSION_ID => StrategyKind::GradualRolloutSessionId,
            GRADUAL_ROLLOUT_RANDOM => StrategyKind::GradualRolloutRandom,
            APPLICATION_HOSTNAME => StrategyKind::ApplicationHostname {
                hostname: &self.hostname,
            },
            REMOTE_ADDRESS => StrategyKind::RemoteAddress,
            FLEXIBLE_ROLLOUT => StrategyKind::FlexibleRollout,
            other => match self.custom.get(other) {
                Some(strategy) => StrategyKind::Custom(strategy.as_ref()),
                None => StrategyKind::Unknown,
            },
        }
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        StrategyRegistry::new(HashMap::new(), StrategyRegistry::local_hostname())
    }
}

impl StrategyKind<'_> {
    /// Evaluate the strategy-specific predicate. Constraints are not considered here.
    pub(crate) fn is_enabled(
        &self,
        parameters: &HashMap<String, String>,
        context: &EvaluationContext,
        sharder: &impl Sharder,
    ) -> bool {
        match self {
            StrategyKind::Default => true,

            StrategyKind::UserWithId => context.user_id.as_deref().is_some_and(|user_id| {
                list_parameter(parameters, "userIds").any(|id| id == user_id)
            }),

            StrategyKind::GradualRolloutUserId => {
                rollout_by_id(context.user_id.as_deref(), parameters, "percentage", sharder)
            }

            StrategyKind::GradualRolloutSessionId => {
                rollout_by_id(context.session_id.as_deref(), parameters, "percentage", sharder)
            }

            StrategyKind::GradualRolloutRandom => {
                random_rollout(percentage_parameter(parameters, "percentage"))
            }

            StrategyKind::ApplicationHostname { hostname } => {
                let hostname = context
                    .properties
                    .get("hostname")
                    .map_or(*hostname, String::as_str);
                list_parameter(parameters, "hostNames")
                    .any(|host| host.eq_ignore_ascii_case(hostname))
            }

            StrategyKind::RemoteAddress => {
                let Some(remote) = context.remote_address.as_deref() else {
                    return false;
                };
                list_parameter(parameters, "IPs").any(|range| ip_matches(range, remote))
            }

            StrategyKind::FlexibleRollout => {
                let stickiness = parameters
                    .get("stickiness")
                    .map(String::as_str)
                    .unwrap_or(DEFAULT);
                match stickiness {
                    DEFAULT => {
                        let id = context
                            .user_id
                            .as_deref()
                            .or(context.session_id.as_deref());
                        match id {
                            Some(_) => rollout_by_id(id, parameters, "rollout", sharder),
                            None => random_rollout(percentage_parameter(parameters, "rollout")),
                        }
                    }
                    "random" => random_rollout(percentage_parameter(parameters, "rollout")),
                    field => {
                        rollout_by_id(context.get(field).as_deref(), parameters, "rollout", sharder)
                    }
                }
            }

            StrategyKind::Custom(strategy) => strategy.is_enabled(parameters, context),

            StrategyKind::Unknown => false,
        }
    }
}

/// Comma-separated list parameter, trimmed, empty entries skipped.
fn list_parameter<'a>(
    parameters: &'a HashMap<String, String>,
    name: &str,
) -> impl Iterator<Item = &'a str> {
    parameters
        .get(name)
        .map(String::as_str)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Percentage parameter in `0..=100`. Missing or invalid values count as 0.
fn percentage_parameter(parameters: &HashMap<String, String>, name: &str) -> u64 {
    parameters
        .get(name)
        .and_then(|p| p.trim().parse::<u64>().ok())
        .unwrap_or(0)
        .min(100)
}

fn rollout_by_id(
    id: Option<&str>,
    parameters: &HashMap<String, String>,
    percentage_name: &str,
    sharder: &impl Sharder,
) -> bool {
    let Some(id) = id else {
        return false;
    };
    let percentage = percentage_parameter(parameters, percentage_name);
    let group_id = parameters.get("groupId").map(String::as_str).unwrap_or("");
    percentage > 0 && normalized_hash(sharder, id, group_id, 100) <= percentage
}

fn random_rollout(percentage: u64) -> bool {
    percentage > 0 && thread_rng().gen_range(1..=100) <= percentage
}

/// `range` is either a single address or a CIDR block.
fn ip_matches(range: &str, remote: &str) -> bool {
    let Ok(remote) = remote.trim().parse::<IpAddr>() else {
        return range == remote.trim();
    };

    let Some((network, prefix)) = range.split_once('/') else {
        return range.parse::<IpAddr>().is_ok_and(|ip| ip == remote);
    };
    let (Ok(network), Ok(prefix)) = (network.parse::<IpAddr>(), prefix.parse::<u32>()) else {
        return false;
    };

    match (network, remote) {
        (IpAddr::V4(network), IpAddr::V4(remote)) if prefix <= 32 => {
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(network) & mask == u32::from(remote) & mask
        }
        (IpAddr::V6(network), IpAddr::V6(remote)) if prefix <= 128 => {
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(network) & mask == u128::from(remote) & mask
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use super::{ip_matches, StrategyKind, StrategyRegistry};
    use crate::{sharder::Md5Sharder, EvaluationContext};

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn registry() -> StrategyRegistry {
        StrategyRegistry::new(HashMap::new(), "web-01".to_owned())
    }

    #[test]
    fn unknown_strategy_is_never_enabled() {
        let registry = registry();
        let kind = registry.lookup("someFutureStrategy");
        assert!(matches!(kind, StrategyKind::Unknown));
        assert!(!kind.is_enabled(&HashMap::new(), &EvaluationContext::new(), &Md5Sharder));
    }

    #[test]
    fn user_with_id() {
        let registry = registry();
        let kind = registry.lookup("userWithId");
        let p = params(&[("userIds", "alice, bob,carol")]);

        let bob = EvaluationContext::new().with_user_id("bob");
        let dave = EvaluationContext::new().with_user_id("dave");
        assert!(kind.is_enabled(&p, &bob, &Md5Sharder));
        assert!(!kind.is_enabled(&p, &dave, &Md5Sharder));
        assert!(!kind.is_enabled(&p, &EvaluationContext::new(), &Md5Sharder));
    }

    #[test]
    fn gradual_rollout_bounds() {
        let registry = registry();
        for name in ["gradualRolloutUserId", "gradualRolloutRandom"] {
            let kind = registry.lookup(name);
            let zero = params(&[("percentage", "0"), ("groupId", "g")]);
            let full = params(&[("percentage", "100"), ("groupId", "g")]);
            for i in 0..500 {
                let ctx = EvaluationContext::new().with_user_id(format!("user-{i}"));
                assert!(!kind.is_enabled(&zero, &ctx, &Md5Sharder), "{name} at 0%");
                assert!(kind.is_enabled(&full, &ctx, &Md5Sharder), "{name} at 100%");
            }
        }
    }

    #[test]
    fn gradual_rollout_is_stable_and_proportional() {
        let registry = registry();
        let kind = registry.lookup("gradualRolloutUserId");
        let p = params(&[("percentage", "50"), ("groupId", "beta-ui")]);

        let u1 = EvaluationContext::new().with_user_id("u1");
        let first = kind.is_enabled(&p, &u1, &Md5Sharder);
        for _ in 0..10 {
            assert_eq!(kind.is_enabled(&p, &u1, &Md5Sharder), first);
        }

        let enabled = (0..10_000)
            .filter(|i| {
                let ctx = EvaluationContext::new().with_user_id(format!("user-{i}"));
                kind.is_enabled(&p, &ctx, &Md5Sharder)
            })
            .count();
        assert!((4_500..5_500).contains(&enabled), "{enabled} enabled");
    }

    #[test]
    fn session_rollout_requires_session() {
        let registry = registry();
        let kind = registry.lookup("gradualRolloutSessionId");
        let p = params(&[("percentage", "100")]);
        assert!(!kind.is_enabled(&p, &EvaluationContext::new().with_user_id("u"), &Md5Sharder));
        assert!(kind.is_enabled(&p, &EvaluationContext::new().with_session_id("s"), &Md5Sharder));
    }

    #[test]
    fn application_hostname() {
        let registry = registry();
        let kind = registry.lookup("applicationHostname");
        assert!(kind.is_enabled(
            &params(&[("hostNames", "db-01, WEB-01")]),
            &EvaluationContext::new(),
            &Md5Sharder
        ));
        assert!(!kind.is_enabled(
            &params(&[("hostNames", "db-01")]),
            &EvaluationContext::new(),
            &Md5Sharder
        ));
        assert!(kind.is_enabled(
            &params(&[("hostNames", "db-01")]),
            &EvaluationContext::new().with_property("hostname", "db-01"),
            &Md5Sharder
        ));
    }

    #[test]
    fn remote_address() {
        let registry = registry();
        let kind = registry.lookup("remoteAddress");
        let p = params(&[("IPs", "192.168.0.1, 10.0.0.0/8, 2001:db8::/32")]);

        for (address, expected) in [
            ("192.168.0.1", true),
            ("192.168.0.2", false),
            ("10.20.30.40", true),
            ("2001:db8::1", true),
            ("2001:db9::1", false),
        ] {
            let ctx = EvaluationContext::new().with_remote_address(address);
            assert_eq!(kind.is_enabled(&p, &ctx, &Md5Sharder), expected, "{address}");
        }
        assert!(!kind.is_enabled(&p, &EvaluationContext::new(), &Md5Sharder));
    }

    #[test]
    fn cidr_edge_cases() {
        assert!(ip_matches("0.0.0.0/0", "8.8.8.8"));
        assert!(ip_matches("8.8.8.8/32", "8.8.8.8"));
        assert!(!ip_matches("8.8.8.8/33", "8.8.8.8"));
        assert!(!ip_matches("10.0.0.0/8", "::1"));
        assert!(ip_matches("not-an-ip", "not-an-ip"));
    }

    #[test]
    fn flexible_rollout_stickiness() {
        let registry = registry();
        let kind = registry.lookup("flexibleRollout");

        let by_user = params(&[("rollout", "100"), ("stickiness", "userId")]);
        assert!(kind.is_enabled(&by_user, &EvaluationContext::new().with_user_id("u"), &Md5Sharder));
        assert!(!kind.is_enabled(&by_user, &EvaluationContext::new(), &Md5Sharder));

        let by_tenant = params(&[("rollout", "100"), ("stickiness", "tenant")]);
        let tenant = EvaluationContext::new().with_property("tenant", "acme");
        assert!(kind.is_enabled(&by_tenant, &tenant, &Md5Sharder));

        let default = params(&[("rollout", "100")]);
        assert!(kind.is_enabled(&default, &EvaluationContext::new(), &Md5Sharder));
        let off = params(&[("rollout", "0")]);
        assert!(!kind.is_enabled(&off, &EvaluationContext::new().with_user_id("u"), &Md5Sharder));
    }

    #[test]
    fn custom_strategy_is_dispatched_by_name() {
        let custom: super::SharedStrategy =
            Arc::new(|p: &HashMap<String, String>, ctx: &EvaluationContext| {
                ctx.properties.get("region") == p.get("region")
            });
        let registry = StrategyRegistry::new(
            [("byRegion".to_owned(), custom)].into_iter().collect(),
            "host".to_owned(),
        );

        let kind = registry.lookup("byRegion");
        let ctx = EvaluationContext::new().with_property("region", "eu");
        assert!(kind.is_enabled(&params(&[("region", "eu")]), &ctx, &Md5Sharder));
        assert!(!kind.is_enabled(&params(&[("region", "us")]), &ctx, &Md5Sharder));
    }
}
