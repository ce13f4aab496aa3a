//! Cohort membership and property group resolution.
use std::collections::HashSet;

use crate::{
    error::InconclusiveMatchError,
    eval::{FlagEvaluator, MatchResult},
    models::{
        ConditionValue, LogicalOperator, Operator, Properties, PropertyGroup, PropertyGroupValues,
        PropertyRule, PropertyType, TryParse,
    },
    rules::{match_property, value_to_string},
    sharder::Sharder,
};

impl<'a, S: Sharder> FlagEvaluator<'a, S> {
    /// Evaluate a rule of any type. `visited` holds the cohorts currently being resolved.
    pub(crate) fn match_rule(
        &mut self,
        rule: &PropertyRule,
        properties: &Properties,
        visited: &mut HashSet<String>,
    ) -> MatchResult<bool> {
        let matched = match rule.property_type {
            PropertyType::Cohort => self.match_cohort_rule(rule, properties, visited)?,
            PropertyType::Flag => self.match_flag_dependency(rule)?,
            PropertyType::Person if rule.operator == Operator::FlagEvaluatesTo => {
                self.match_flag_dependency(rule)?
            }
            // Negation is applied by the property matcher.
            PropertyType::Person => return match_property(rule, properties, self.now),
        };
        Ok(matched != rule.negation)
    }

    fn match_cohort_rule(
        &mut self,
        rule: &PropertyRule,
        properties: &Properties,
        visited: &mut HashSet<String>,
    ) -> MatchResult<bool> {
        let cohort_id = match &rule.value {
            Some(ConditionValue::Single(value)) => value_to_string(value),
            _ => return Err(InconclusiveMatchError::MissingCohortId),
        };
        self.match_cohort(&cohort_id, properties, visited)
    }

    /// Returns `true` if `properties` satisfy the cohort with `cohort_id`.
    pub(crate) fn match_cohort(
        &mut self,
        cohort_id: &str,
        properties: &Properties,
        visited: &mut HashSet<String>,
    ) -> MatchResult<bool> {
        if !visited.insert(cohort_id.to_owned()) {
            log::warn!(target: "flagcore", cohort_id; "cohort references itself");
            return Err(InconclusiveMatchError::CohortCycle(cohort_id.to_owned()));
        }

        let definitions = self.definitions;
        let result = match definitions.cohorts.get(cohort_id) {
            Some(cohort) => self.match_property_group(cohort, properties, visited),
            None => Err(InconclusiveMatchError::CohortNotFound(cohort_id.to_owned())),
        };

        visited.remove(cohort_id);
        result
    }

    /// Evaluate a property group.
    ///
    /// `AND` stops at the first `false` and `OR` at the first `true`. Members that can't be
    /// decided don't stop evaluation, but make the group undecided if nothing short-circuits.
    pub(crate) fn match_property_group(
        &mut self,
        group: &PropertyGroup,
        properties: &Properties,
        visited: &mut HashSet<String>,
    ) -> MatchResult<bool> {
        let mut is_inconclusive = false;

        match &group.values {
            PropertyGroupValues::Nested(groups) => {
                for nested in groups {
                    match self.match_property_group(nested, properties, visited) {
                        Ok(matches) => {
                            if let Some(result) = short_circuit(group.connective, matches) {
                                return Ok(result);
                            }
                        }
                        Err(err) => {
                            log::debug!(target: "flagcore", "failed to compute nested property group locally: {}", err);
                            is_inconclusive = true;
                        }
                    }
                }
            }
            PropertyGroupValues::Leaf(rules) => {
                for rule in rules {
                    let TryParse::Parsed(rule) = rule else {
                        // Malformed rules never match.
                        if let Some(result) = short_circuit(group.connective, false) {
                            return Ok(result);
                        }
                        continue;
                    };
                    match self.match_rule(rule, properties, visited) {
                        Ok(matches) => {
                            if let Some(result) = short_circuit(group.connective, matches) {
                                return Ok(result);
                            }
                        }
                        Err(err) => {
                            log::debug!(target: "flagcore",
                                        key:display = rule.key;
                                        "failed to compute property locally: {}", err);
                            is_inconclusive = true;
                        }
                    }
                }
            }
        }

        if is_inconclusive {
            return Err(InconclusiveMatchError::PropertyGroup);
        }

        // All matched for AND, none matched for OR. Empty groups match.
        Ok(group.values.is_empty() || group.connective == LogicalOperator::And)
    }
}

fn short_circuit(connective: LogicalOperator, matches: bool) -> Option<bool> {
    match (connective, matches) {
        (LogicalOperator::And, false) => Some(false),
        (LogicalOperator::Or, true) => Some(true),
        _ => None,
    }
}
