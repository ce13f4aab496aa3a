use std::collections::HashMap;

use crate::models::Properties;

/// Everything known about the subject of a flag evaluation.
///
/// Person-scoped flags are evaluated against `distinct_id` and `person_properties`. Group-scoped
/// flags are evaluated against the group key found in `groups` and that group's entry in
/// `group_properties`.
///
/// `None` and an empty map are treated as different contexts by the result cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationContext {
    /// Unique identifier of the person.
    pub distinct_id: String,
    /// Group type name to group key, e.g. `"company" => "acme"`.
    pub groups: Option<HashMap<String, String>>,
    /// Properties of the person.
    pub person_properties: Option<Properties>,
    /// Group type name to properties of that group.
    pub group_properties: Option<HashMap<String, Properties>>,
}

impl EvaluationContext {
    /// Create a context for `distinct_id` with no groups or properties.
    pub fn new(distinct_id: impl Into<String>) -> EvaluationContext {
        EvaluationContext {
            distinct_id: distinct_id.into(),
            ..Default::default()
        }
    }

    /// Set groups the person belongs to.
    pub fn with_groups(mut self, groups: HashMap<String, String>) -> EvaluationContext {
        self.groups = Some(groups);
        self
    }

    /// Set person properties.
    pub fn with_person_properties(mut self, properties: Properties) -> EvaluationContext {
        self.person_properties = Some(properties);
        self
    }

    /// Set properties for each group type.
    pub fn with_group_properties(
        mut self,
        properties: HashMap<String, Properties>,
    ) -> EvaluationContext {
        self.group_properties = Some(properties);
        self
    }

    pub(crate) fn group_key(&self, group_type: &str) -> Option<&str> {
        self.groups.as_ref()?.get(group_type).map(String::as_str)
    }

    pub(crate) fn group_properties_for(&self, group_type: &str) -> Option<&Properties> {
        self.group_properties.as_ref()?.get(group_type)
    }
}
