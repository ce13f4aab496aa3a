use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::{
    context::EvaluationContext,
    definitions_store::DefinitionsSnapshot,
    error::InconclusiveMatchError,
    models::{
        ConditionGroup, ConditionValue, FlagDefinition, FlagValue, Operator, Properties,
        PropertyRule, Value,
    },
    sharder::{is_in_rollout, matching_variant, Sharder},
};

pub(crate) type MatchResult<T> = std::result::Result<T, InconclusiveMatchError>;

/// Evaluates flags of one [`DefinitionsSnapshot`] for one [`EvaluationContext`].
///
/// Every flag is evaluated at most once per evaluator, so flags that are depended upon by several
/// others are not recomputed. Create a new evaluator for every top-level request.
pub(crate) struct FlagEvaluator<'a, S: Sharder> {
    pub(crate) definitions: &'a DefinitionsSnapshot,
    context: &'a EvaluationContext,
    sharder: &'a S,
    pub(crate) now: DateTime<Utc>,
    evaluated: HashMap<String, MatchResult<FlagValue>>,
    in_progress: HashSet<String>,
}

impl<'a, S: Sharder> FlagEvaluator<'a, S> {
    pub(crate) fn new(
        definitions: &'a DefinitionsSnapshot,
        context: &'a EvaluationContext,
        sharder: &'a S,
        now: DateTime<Utc>,
    ) -> Self {
        FlagEvaluator {
            definitions,
            context,
            sharder,
            now,
            evaluated: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }

    /// Evaluate the flag with `flag_key`. Returns `None` if there is no such flag.
    pub(crate) fn evaluate_key(&mut self, flag_key: &str) -> Option<MatchResult<FlagValue>> {
        let definitions = self.definitions;
        let flag = definitions.get_flag(flag_key)?;
        Some(self.evaluate(flag))
    }

    pub(crate) fn evaluate(&mut self, flag: &'a FlagDefinition) -> MatchResult<FlagValue> {
        if let Some(result) = self.evaluated.get(&flag.key) {
            return result.clone();
        }
        if !self.in_progress.insert(flag.key.clone()) {
            log::warn!(target: "flagcore", flag_key:display = flag.key; "circular flag dependency");
            return Err(InconclusiveMatchError::CircularDependency(flag.key.clone()));
        }

        let result = self.compute(flag);

        self.in_progress.remove(&flag.key);
        log::trace!(target: "flagcore",
                    flag_key:display = flag.key,
                    distinct_id:display = self.context.distinct_id,
                    result:? = result;
                    "evaluated flag locally");
        self.evaluated.insert(flag.key.clone(), result.clone());
        result
    }

    /// Resolve which id and properties the flag is evaluated against.
    fn compute(&mut self, flag: &'a FlagDefinition) -> MatchResult<FlagValue> {
        if !flag.active {
            return Ok(FlagValue::Boolean(false));
        }

        let context = self.context;
        let definitions = self.definitions;
        let empty = Properties::new();

        let Some(group_type_index) = flag.filters.aggregation_group_type_index else {
            let properties = context.person_properties.as_ref().unwrap_or(&empty);
            return self.match_feature_flag_properties(flag, &context.distinct_id, properties);
        };

        let Some(group_type) = definitions
            .group_type_mapping
            .get(&group_type_index.to_string())
        else {
            log::warn!(target: "flagcore",
                       flag_key:display = flag.key,
                       group_type_index;
                       "unknown group type index");
            return Err(InconclusiveMatchError::UnknownGroupTypeIndex(
                group_type_index,
            ));
        };

        let Some(group_key) = context.group_key(group_type) else {
            // Group not provided. The flag is off and there is no point asking the server.
            log::debug!(target: "flagcore",
                        flag_key:display = flag.key,
                        group_type:display = group_type;
                        "can't compute group flag without group");
            return Ok(FlagValue::Boolean(false));
        };
        let properties = context.group_properties_for(group_type).unwrap_or(&empty);

        self.match_feature_flag_properties(flag, group_key, properties)
    }

    /// Find the first condition group that matches `distinct_id` and `properties`.
    pub(crate) fn match_feature_flag_properties(
        &mut self,
        flag: &'a FlagDefinition,
        distinct_id: &str,
        properties: &Properties,
    ) -> MatchResult<FlagValue> {
        if flag.ensure_experience_continuity {
            return Err(InconclusiveMatchError::ExperienceContinuity(
                flag.key.clone(),
            ));
        }

        let mut is_inconclusive = false;

        for condition in &flag.filters.groups {
            match self.is_condition_match(flag, condition, distinct_id, properties) {
                Ok(true) => {
                    let variant = condition
                        .variant
                        .as_deref()
                        .filter(|variant| flag.has_variant(variant))
                        .or_else(|| matching_variant(self.sharder, flag, distinct_id));

                    return Ok(match variant {
                        Some(variant) => FlagValue::Variant(variant.to_owned()),
                        None => FlagValue::Boolean(true),
                    });
                }
                Ok(false) => {}
                Err(err) => {
                    log::debug!(target: "flagcore",
                                flag_key:display = flag.key;
                                "condition is inconclusive: {}", err);
                    is_inconclusive = true;
                }
            }
        }

        if is_inconclusive {
            // We can only return `false` when no condition was inconclusive.
            return Err(InconclusiveMatchError::NoConclusiveCondition(
                flag.key.clone(),
            ));
        }

        Ok(FlagValue::Boolean(false))
    }

    fn is_condition_match(
        &mut self,
        flag: &FlagDefinition,
        condition: &ConditionGroup,
        distinct_id: &str,
        properties: &Properties,
    ) -> MatchResult<bool> {
        for rule in &condition.properties {
            if !self.match_rule(rule, properties, &mut HashSet::new())? {
                return Ok(false);
            }
        }

        let rollout_percentage = condition.rollout_percentage.unwrap_or(100.0);
        Ok(is_in_rollout(
            self.sharder,
            &flag.key,
            distinct_id,
            rollout_percentage,
        ))
    }

    /// Evaluate a `flag_evaluates_to` rule.
    ///
    /// Flags in the dependency chain are evaluated in order. A chain member evaluating to `false`
    /// makes the rule `false` regardless of the expected value.
    pub(crate) fn match_flag_dependency(&mut self, rule: &PropertyRule) -> MatchResult<bool> {
        let chain = rule
            .dependency_chain
            .as_ref()
            .ok_or_else(|| InconclusiveMatchError::MissingDependencyChain(rule.key.clone()))?;

        // The server sends an empty chain for circular dependencies.
        if chain.is_empty() {
            log::warn!(target: "flagcore", flag_key:display = rule.key; "circular flag dependency");
            return Err(InconclusiveMatchError::CircularDependency(rule.key.clone()));
        }

        for flag_key in chain.iter().chain(std::iter::once(&rule.key)) {
            if self.evaluate_dependency(flag_key)? == FlagValue::Boolean(false) {
                return Ok(false);
            }
        }

        let Some(expected) = &rule.value else {
            return Ok(true);
        };
        if rule.operator != Operator::FlagEvaluatesTo {
            return Err(InconclusiveMatchError::InvalidDependencyOperator(
                rule.key.clone(),
            ));
        }

        let actual = self.evaluate_dependency(&rule.key)?;
        Ok(matches_dependency_value(expected, &actual))
    }

    fn evaluate_dependency(&mut self, flag_key: &str) -> MatchResult<FlagValue> {
        let definitions = self.definitions;
        let flag = definitions
            .get_flag(flag_key)
            .ok_or_else(|| InconclusiveMatchError::DependencyNotFound(flag_key.to_owned()))?;

        self.evaluate(flag).map_err(|err| match err {
            InconclusiveMatchError::CircularDependency(_) => err,
            _ => InconclusiveMatchError::DependencyInconclusive(flag_key.to_owned()),
        })
    }
}

/// Compare the value of a flag dependency with the expected value of the rule.
///
/// A variant matches `true` or its own key (case-sensitive). A boolean matches the same boolean.
fn matches_dependency_value(expected: &ConditionValue, actual: &FlagValue) -> bool {
    match (actual, expected) {
        (FlagValue::Variant(variant), ConditionValue::Single(Value::Boolean(expected))) => {
            !variant.is_empty() && *expected
        }
        (FlagValue::Variant(variant), ConditionValue::Single(Value::String(expected))) => {
            !variant.is_empty() && variant == expected
        }
        (FlagValue::Boolean(actual), ConditionValue::Single(Value::Boolean(expected))) => {
            actual == expected
        }
        _ => false,
    }
}

impl FlagDefinition {
    fn has_variant(&self, key: &str) -> bool {
        self.filters
            .multivariate
            .as_ref()
            .is_some_and(|multivariate| multivariate.variants.iter().any(|v| v.key == key))
    }

    /// Look up the payload for an evaluated value of this flag.
    pub(crate) fn payload(&self, value: &FlagValue) -> Option<&serde_json::Value> {
        self.filters.payloads.get(value.payload_key()?)
    }
}
