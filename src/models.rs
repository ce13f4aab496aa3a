//! Wire models for the local evaluation and flags endpoints.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use derive_more::From;
use serde::{de, Deserialize, Deserializer, Serialize};

/// Key-value properties of a person or a group.
pub type Properties = HashMap<String, AttributeValue>;

/// A single property value supplied by the caller.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numeric value. Integers are represented as `f64`.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// An explicit `null`. Differs from the property being absent.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<DateTime<Utc>> for AttributeValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::String(value.to_rfc3339())
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// The value parsed successfully.
    Parsed(T),
    /// The value didn't parse. The raw JSON is kept for diagnostics.
    ParseFailed(serde_json::Value),
}
impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Response of the local evaluation endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalEvaluationResponse {
    /// Flag definitions. A flag that fails to parse doesn't affect the others.
    #[serde(default, deserialize_with = "null_as_default")]
    pub flags: Vec<TryParse<FlagDefinition>>,
    /// Group type index (as a string) to group type name.
    #[serde(default, deserialize_with = "null_as_default")]
    pub group_type_mapping: HashMap<String, String>,
    /// Cohort id to cohort definition.
    #[serde(default, deserialize_with = "null_as_default")]
    pub cohorts: HashMap<String, TryParse<CohortDefinition>>,
}

/// A feature flag as served for local evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagDefinition {
    /// Server-side id.
    pub id: i64,
    /// Human readable name.
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    /// Key used to look the flag up.
    pub key: String,
    /// Inactive flags evaluate to `false` for everyone.
    pub active: bool,
    /// Targeting rules.
    #[serde(default, deserialize_with = "null_as_default")]
    pub filters: FlagFilters,
    /// Revision of the definition.
    #[serde(default)]
    pub version: Option<i64>,
    /// Flags that keep a person's value across identities need server-side state and can't be
    /// evaluated locally.
    #[serde(default, deserialize_with = "null_as_default")]
    pub ensure_experience_continuity: bool,
}

/// Targeting rules of a flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlagFilters {
    /// Condition groups, tried in order until one matches.
    #[serde(default, deserialize_with = "null_as_default")]
    pub groups: Vec<ConditionGroup>,
    /// Variants of a multivariate flag. `None` for boolean flags.
    #[serde(default)]
    pub multivariate: Option<MultivariateConfig>,
    /// Payloads keyed by variant key, or by `"true"` for boolean flags.
    #[serde(default, deserialize_with = "null_as_default")]
    pub payloads: HashMap<String, serde_json::Value>,
    /// `None` for person flags. Group flags aggregate by this group type.
    #[serde(default)]
    pub aggregation_group_type_index: Option<i32>,
}

/// Rules are AND-combined. A group with no rules matches everyone within the rollout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionGroup {
    /// Rules that must all match.
    #[serde(default, deserialize_with = "null_as_default")]
    pub properties: Vec<PropertyRule>,
    /// `None` means 100.
    #[serde(default)]
    pub rollout_percentage: Option<f64>,
    /// Variant forced for subjects matching this group.
    #[serde(default)]
    pub variant: Option<String>,
}

/// Variants of a multivariate flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultivariateConfig {
    /// Variants in bucketing order. Percentages add up to 100.
    #[serde(default, deserialize_with = "null_as_default")]
    pub variants: Vec<VariantDefinition>,
}

/// One variant of a multivariate flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantDefinition {
    /// Variant key returned as the flag value.
    pub key: String,
    /// Share of subjects (0-100) assigned to this variant.
    pub rollout_percentage: f64,
}

/// A single condition on a property, a cohort, or another flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyRule {
    /// Property name, or flag key for flag rules.
    pub key: String,
    /// Expected value. Holds the cohort id for cohort rules.
    #[serde(default)]
    pub value: Option<ConditionValue>,
    /// Comparison to apply.
    #[serde(default, deserialize_with = "null_as_default")]
    pub operator: Operator,
    /// What the rule is about.
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub property_type: PropertyType,
    /// Invert a definite result.
    #[serde(default, deserialize_with = "null_as_default")]
    pub negation: bool,
    /// Flag keys to evaluate, in order, before this flag dependency. Empty means circular.
    #[serde(default)]
    pub dependency_chain: Option<Vec<String>>,
}

/// Expected value of a rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConditionValue {
    /// Any of several values.
    Multiple(Vec<Value>),
    /// One value.
    Single(Value),
}

impl<T: Into<Value>> From<T> for ConditionValue {
    fn from(value: T) -> Self {
        Self::Single(value.into())
    }
}
impl<T: Into<Value>> From<Vec<T>> for ConditionValue {
    fn from(value: Vec<T>) -> Self {
        Self::Multiple(value.into_iter().map(Into::into).collect())
    }
}

/// Scalar subset of [`serde_json::Value`] used in rule definitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, From)]
#[serde(untagged)]
pub enum Value {
    /// A boolean.
    Boolean(bool),
    /// A number.
    Number(f64),
    /// A string.
    String(String),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// Comparison applied by a [`PropertyRule`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Equal to the value, or to any of the values (case-insensitive).
    #[default]
    Exact,
    /// Equal to none of the values (case-insensitive).
    IsNot,
    /// The property is present.
    IsSet,
    /// The property is absent. Can't be decided locally.
    IsNotSet,
    /// Contains the value (case-insensitive).
    Icontains,
    /// Doesn't contain the value (case-insensitive).
    NotIcontains,
    /// Matches the regular expression.
    Regex,
    /// Doesn't match the regular expression.
    NotRegex,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Date before an absolute or relative date.
    IsDateBefore,
    /// Date after an absolute or relative date.
    IsDateAfter,
    /// Member of a cohort.
    In,
    /// Another flag evaluates to the value.
    FlagEvaluatesTo,
    /// Any operator this version does not know. Never matches.
    #[serde(other)]
    Unknown,
}

/// Kind of a [`PropertyRule`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    /// Cohort membership.
    Cohort,
    /// Dependency on another flag.
    Flag,
    /// Person and group property rules, and any unknown type.
    #[default]
    #[serde(other)]
    Person,
}

/// Connective of a [`PropertyGroup`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogicalOperator {
    /// Every member must match.
    #[default]
    And,
    /// At least one member must match.
    Or,
}

/// A logical connective over either property rules or nested groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyGroup {
    /// How members are combined.
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub connective: LogicalOperator,
    /// Members of the group.
    #[serde(default)]
    pub values: PropertyGroupValues,
}

/// Cohorts are stored as their top-level property group, keyed by cohort id.
pub type CohortDefinition = PropertyGroup;

/// Body of a [`PropertyGroup`].
///
/// The wire format does not tag which kind of list `values` holds, so the kind is decided once at
/// parse time from the shape of the first element.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PropertyGroupValues {
    /// Property rules. A rule that fails to parse is kept and never matches.
    Leaf(Vec<TryParse<PropertyRule>>),
    /// Nested groups.
    Nested(Vec<PropertyGroup>),
}

impl Default for PropertyGroupValues {
    fn default() -> Self {
        Self::Leaf(Vec::new())
    }
}

impl PropertyGroupValues {
    /// Returns `true` if the group has no members.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Leaf(rules) => rules.is_empty(),
            Self::Nested(groups) => groups.is_empty(),
        }
    }
}

impl<'de> Deserialize<'de> for PropertyGroupValues {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();

        let nested = items.first().is_some_and(|first| {
            first.get("key").is_none() && first.get("type").is_some() && first.get("values").is_some()
        });

        if nested {
            items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<PropertyGroup>, _>>()
                .map(Self::Nested)
                .map_err(de::Error::custom)
        } else {
            let rules = items
                .into_iter()
                .map(|item| match PropertyRule::deserialize(&item) {
                    Ok(rule) => TryParse::Parsed(rule),
                    Err(err) => {
                        log::warn!(target: "flagcore", "malformed property rule will never match: {}", err);
                        TryParse::ParseFailed(item)
                    }
                })
                .collect();
            Ok(Self::Leaf(rules))
        }
    }
}

/// A computed flag value: either a variant key or a plain boolean.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum FlagValue {
    /// A boolean flag value.
    Boolean(bool),
    /// The key of the variant a multivariate flag resolved to.
    Variant(String),
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        Self::Variant(value.to_owned())
    }
}

impl FlagValue {
    /// A flag is enabled when it is `true` or resolved to any variant.
    pub fn is_enabled(&self) -> bool {
        match self {
            FlagValue::Boolean(b) => *b,
            FlagValue::Variant(_) => true,
        }
    }

    /// Returns the variant key, or `None` for boolean values.
    pub fn as_variant(&self) -> Option<&str> {
        match self {
            FlagValue::Variant(v) => Some(v),
            FlagValue::Boolean(_) => None,
        }
    }

    /// Returns the boolean, or `None` for variants.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            FlagValue::Boolean(b) => Some(*b),
            FlagValue::Variant(_) => None,
        }
    }

    /// Key under which this value's payload is stored in [`FlagFilters::payloads`].
    pub(crate) fn payload_key(&self) -> Option<&str> {
        match self {
            FlagValue::Boolean(true) => Some("true"),
            FlagValue::Boolean(false) => None,
            FlagValue::Variant(v) => Some(v),
        }
    }
}

impl std::fmt::Display for FlagValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlagValue::Boolean(b) => write!(f, "{b}"),
            FlagValue::Variant(v) => f.write_str(v),
        }
    }
}

/// Response of the remote flags endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFlagsResponse {
    /// Flag key to value.
    #[serde(rename = "featureFlags", default, deserialize_with = "null_as_default")]
    pub flags: HashMap<String, FlagValue>,
    /// Flag key to payload of the value it resolved to.
    #[serde(
        rename = "featureFlagPayloads",
        default,
        deserialize_with = "null_as_default"
    )]
    pub payloads: HashMap<String, serde_json::Value>,
    /// When set, `flags` is a partial result and must be merged into known flags.
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors_while_computing_flags: bool,
    /// Resources the project has exceeded its quota for.
    #[serde(default, deserialize_with = "null_as_default")]
    pub quota_limited: Vec<String>,
    /// Server-assigned id of the request.
    #[serde(default)]
    pub request_id: Option<String>,
}

impl RemoteFlagsResponse {
    /// `true` when the project has exceeded its feature flag quota.
    pub fn is_quota_limited(&self) -> bool {
        self.quota_limited.iter().any(|it| it == "feature_flags")
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}
