use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Segment identifier as issued by the server.
pub type SegmentId = i64;

/// Complete, immutable snapshot of all toggle definitions.
///
/// On the wire (and in the cache file) toggles and segments are lists. In memory they are keyed by
/// name and id respectively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ToggleCollectionWire", into = "ToggleCollectionWire")]
pub struct ToggleCollection {
    version: u32,
    toggles: HashMap<String, ToggleDefinition>,
    segments: HashMap<SegmentId, Segment>,
}

#[allow(missing_docs)]
impl ToggleCollection {
    /// Current format version.
    pub const VERSION: u32 = 2;

    /// Build a collection from toggles and segments. If names (or ids) collide, the last one wins.
    pub fn new(
        toggles: impl IntoIterator<Item = ToggleDefinition>,
        segments: impl IntoIterator<Item = Segment>,
    ) -> ToggleCollection {
        ToggleCollection {
            version: Self::VERSION,
            toggles: toggles
                .into_iter()
                .map(|toggle| (toggle.name.clone(), toggle))
                .collect(),
            segments: segments
                .into_iter()
                .map(|segment| (segment.id, segment))
                .collect(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn toggle(&self, name: &str) -> Option<&ToggleDefinition> {
        self.toggles.get(name)
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(&id)
    }

    pub fn toggles(&self) -> impl Iterator<Item = &ToggleDefinition> {
        self.toggles.values()
    }

    /// Number of toggles in the collection.
    pub fn len(&self) -> usize {
        self.toggles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toggles.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToggleCollectionWire {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    features: Vec<TryParse<ToggleDefinition>>,
    #[serde(default)]
    segments: Vec<TryParse<Segment>>,
}

fn default_version() -> u32 {
    ToggleCollection::VERSION
}

impl From<ToggleCollectionWire> for ToggleCollection {
    fn from(wire: ToggleCollectionWire) -> ToggleCollection {
        let toggles = wire.features.into_iter().filter_map(|feature| match feature {
            TryParse::Parsed(toggle) => Some(toggle),
            TryParse::ParseFailed(json) => {
                log::warn!(target: "flagwise",
                           toggle_name:display = json.get("name").and_then(|n| n.as_str()).unwrap_or("<unnamed>");
                           "skipping toggle that failed to parse");
                None
            }
        });

        // Strategies referencing a dropped segment fail closed.
        let segments = wire.segments.into_iter().filter_map(|segment| match segment {
            TryParse::Parsed(segment) => Some(segment),
            TryParse::ParseFailed(json) => {
                log::warn!(target: "flagwise",
                           segment_id:display = json.get("id").map_or_else(|| "<no id>".to_owned(), |id| id.to_string());
                           "skipping segment that failed to parse");
                None
            }
        });

        ToggleCollection {
            version: wire.version,
            ..ToggleCollection::new(toggles, segments)
        }
    }
}

impl From<ToggleCollection> for ToggleCollectionWire {
    fn from(collection: ToggleCollection) -> ToggleCollectionWire {
        let mut features: Vec<_> = collection.toggles.into_values().collect();
        features.sort_by(|a, b| a.name.cmp(&b.name));
        let mut segments: Vec<_> = collection.segments.into_values().collect();
        segments.sort_by_key(|segment| segment.id);

        ToggleCollectionWire {
            version: collection.version,
            features: features.into_iter().map(TryParse::Parsed).collect(),
            segments: segments.into_iter().map(TryParse::Parsed).collect(),
        }
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
///
/// A toggle or segment the client doesn't understand (e.g., written by a newer server) is dropped
/// while the rest of the collection stays usable.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

/// A single feature toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ToggleDefinition {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategies: Vec<ActivationStrategy>,
    #[serde(default)]
    pub variants: Vec<VariantDefinition>,
    /// Emit an [`ImpressionEvent`](crate::ImpressionEvent) every time this toggle is evaluated.
    #[serde(default)]
    pub impression_data: bool,
}

#[allow(missing_docs)]
impl ToggleDefinition {
    /// Create a toggle without strategies or variants.
    pub fn new(name: impl Into<String>, enabled: bool) -> ToggleDefinition {
        ToggleDefinition {
            name: name.into(),
            enabled,
            strategies: Vec::new(),
            variants: Vec::new(),
            impression_data: false,
        }
    }

    /// Append a strategy.
    pub fn with_strategy(mut self, strategy: ActivationStrategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Replace variants.
    pub fn with_variants(mut self, variants: Vec<VariantDefinition>) -> Self {
        self.variants = variants;
        self
    }

    /// Enable or disable impression events.
    pub fn with_impression_data(mut self, impression_data: bool) -> Self {
        self.impression_data = impression_data;
        self
    }

    /// Stickiness of the variant group. The group shares the stickiness of its first variant.
    pub(crate) fn variant_stickiness(&self) -> Option<&str> {
        self.variants
            .first()
            .and_then(|variant| variant.stickiness.as_deref())
            .filter(|stickiness| *stickiness != VariantDefinition::DEFAULT_STICKINESS)
    }
}

/// A parameterized activation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ActivationStrategy {
    /// Key into the strategy registry.
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_parameters")]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// References into [`ToggleCollection`] segments, resolved at evaluation time.
    #[serde(default)]
    pub segments: Vec<SegmentId>,
}

#[allow(missing_docs)]
impl ActivationStrategy {
    pub fn new(name: impl Into<String>) -> ActivationStrategy {
        ActivationStrategy {
            name: name.into(),
            parameters: HashMap::new(),
            constraints: Vec::new(),
            segments: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_segment(mut self, id: SegmentId) -> Self {
        self.segments.push(id);
        self
    }
}

/// Servers sometimes send numeric parameters unquoted. Scalars are accepted and stringified.
fn deserialize_parameters<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<HashMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((name, value))
        })
        .collect())
}

/// A predicate over a single context field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Constraint {
    pub context_name: String,
    pub operator: Operator,
    /// Operand set for set-membership and string operators.
    #[serde(default)]
    pub values: Vec<String>,
    /// Single operand for numeric, date, and semver operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub case_insensitive: bool,
    /// Invert the result of the comparison.
    #[serde(default)]
    pub inverted: bool,
}

#[allow(missing_docs)]
impl Constraint {
    /// Create a constraint with a set of operands.
    pub fn new<I, S>(context_name: impl Into<String>, operator: Operator, values: I) -> Constraint
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Constraint {
            context_name: context_name.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
            value: None,
            case_insensitive: false,
            inverted: false,
        }
    }

    /// Create a constraint with a single operand.
    pub fn single(
        context_name: impl Into<String>,
        operator: Operator,
        value: impl Into<String>,
    ) -> Constraint {
        Constraint {
            value: Some(value.into()),
            ..Constraint::new(context_name, operator, Vec::<String>::new())
        }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    pub fn inverted(mut self) -> Self {
        self.inverted = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum Operator {
    In,
    NotIn,
    StrContains,
    StrStartsWith,
    StrEndsWith,
    NumEq,
    NumGt,
    NumGte,
    NumLt,
    NumLte,
    DateAfter,
    DateBefore,
    SemverEq,
    SemverGt,
    SemverLt,
    /// Operator added server-side after this client was built. Never satisfied.
    #[serde(other)]
    Unknown,
}

/// A reusable bundle of constraints referenced by strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Segment {
    pub id: SegmentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

#[allow(missing_docs)]
impl Segment {
    pub fn new(id: SegmentId, constraints: Vec<Constraint>) -> Segment {
        Segment {
            id,
            name: None,
            constraints,
        }
    }
}

/// One weighted option of a toggle's variant group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct VariantDefinition {
    pub name: String,
    /// Relative weight within the group.
    #[serde(default)]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    /// Context field used to pin an identity to a variant. `None` or `"default"` uses the
    /// session id, then the user id, then a random value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stickiness: Option<String>,
    /// Forced assignments that bypass weighted selection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<VariantOverride>,
}

#[allow(missing_docs)]
impl VariantDefinition {
    pub const DEFAULT_STICKINESS: &'static str = "default";

    pub fn new(name: impl Into<String>, weight: u32) -> VariantDefinition {
        VariantDefinition {
            name: name.into(),
            weight,
            payload: None,
            stickiness: None,
            overrides: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_stickiness(mut self, stickiness: impl Into<String>) -> Self {
        self.stickiness = Some(stickiness.into());
        self
    }

    pub fn with_override(mut self, variant_override: VariantOverride) -> Self {
        self.overrides.push(variant_override);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Payload {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub value: String,
}

/// Assign a variant to every context whose `context_name` field is one of `values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct VariantOverride {
    pub context_name: String,
    pub values: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::{Operator, ToggleCollection, ToggleDefinition};

    #[test]
    fn parse_collection() {
        let collection: ToggleCollection = serde_json::from_str(
            r#"
              {
                "version": 2,
                "features": [
                  {
                    "name": "beta-ui",
                    "type": "release",
                    "enabled": true,
                    "impressionData": true,
                    "strategies": [
                      {
                        "name": "flexibleRollout",
                        "parameters": { "rollout": 50, "stickiness": "userId", "groupId": "beta-ui" },
                        "constraints": [
                          { "contextName": "environment", "operator": "IN", "values": ["prod"] }
                        ],
                        "segments": [7]
                      }
                    ],
                    "variants": [
                      { "name": "blue", "weight": 500, "stickiness": "default",
                        "payload": { "type": "string", "value": "b" } },
                      { "name": "red", "weight": 500,
                        "overrides": [{ "contextName": "userId", "values": ["u9"] }] }
                    ]
                  }
                ],
                "segments": [
                  { "id": 7, "name": "internal", "constraints": [
                    { "contextName": "email", "operator": "STR_ENDS_WITH", "values": ["@corp.com"],
                      "caseInsensitive": true }
                  ] }
                ]
              }
            "#,
        )
        .unwrap();

        assert_eq!(collection.version(), 2);
        assert_eq!(collection.len(), 1);

        let toggle = collection.toggle("beta-ui").unwrap();
        assert!(toggle.impression_data);
        assert_eq!(toggle.strategies[0].parameters["rollout"], "50");
        assert_eq!(toggle.strategies[0].segments, vec![7]);
        assert_eq!(toggle.variants[1].overrides[0].values, vec!["u9"]);
        assert_eq!(toggle.variant_stickiness(), None);

        let segment = collection.segment(7).unwrap();
        assert_eq!(segment.constraints[0].operator, Operator::StrEndsWith);
        assert!(segment.constraints[0].case_insensitive);
    }

    #[test]
    fn parse_partially_if_unexpected() {
        let collection: ToggleCollection = serde_json::from_str(
            r#"
              {
                "features": [
                  { "name": "success", "enabled": true },
                  { "name": "fail_parsing", "enabled": "maybe" }
                ]
              }
            "#,
        )
        .unwrap();

        assert!(collection.toggle("success").is_some());
        assert!(collection.toggle("fail_parsing").is_none());
    }

    #[test]
    fn malformed_segment_is_dropped_alone() {
        let collection: ToggleCollection = serde_json::from_str(
            r#"
              {
                "features": [ { "name": "ok", "enabled": true } ],
                "segments": [
                  { "id": 1, "constraints": [ { "operator": "IN", "values": ["a"] } ] },
                  { "id": 2, "constraints": [] }
                ]
              }
            "#,
        )
        .unwrap();

        assert!(collection.toggle("ok").is_some());
        assert!(collection.segment(1).is_none());
        assert!(collection.segment(2).is_some());
    }

    #[test]
    fn unknown_operator_is_preserved_as_unknown() {
        let collection: ToggleCollection = serde_json::from_str(
            r#"
              { "features": [ { "name": "t", "enabled": true, "strategies": [ {
                  "name": "default",
                  "constraints": [ { "contextName": "x", "operator": "REGEX_MATCH", "values": [] } ]
              } ] } ] }
            "#,
        )
        .unwrap();

        let toggle = collection.toggle("t").unwrap();
        assert_eq!(
            toggle.strategies[0].constraints[0].operator,
            Operator::Unknown
        );
    }

    #[test]
    fn serializes_as_sorted_lists() {
        let collection = ToggleCollection::new(
            [
                ToggleDefinition::new("b", true),
                ToggleDefinition::new("a", false),
            ],
            [],
        );

        let json = serde_json::to_value(&collection).unwrap();
        assert_eq!(json["features"][0]["name"], "a");
        assert_eq!(json["features"][1]["name"], "b");

        let parsed: ToggleCollection = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, collection);
    }
}
