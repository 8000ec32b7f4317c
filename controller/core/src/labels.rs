use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type Map = BTreeMap<String, String>;

/// Selects the pods a `PodConfigMapConfig` applies to. Equality matches and
/// set expressions are ANDed, following the Kubernetes `LabelSelector` wire
/// shape. An empty selector matches everything in the namespace.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Vec<Expression>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: Option<BTreeSet<String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

// === impl Selector ===

impl Selector {
    pub fn matches(&self, labels: &Map) -> bool {
        if let Some(expressions) = self.match_expressions.as_ref() {
            if !expressions.iter().all(|e| e.matches(labels)) {
                return false;
            }
        }

        self.match_labels
            .iter()
            .flatten()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            match_labels: Some(iter.into_iter().collect()),
            match_expressions: None,
        }
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(iter.into_iter().collect()),
        }
    }
}

// === impl Expression ===

impl Expression {
    pub fn new(key: impl Into<String>, operator: Operator, values: Option<BTreeSet<String>>) -> Self {
        Self {
            key: key.into(),
            operator,
            values,
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match (self.operator, self.values.as_ref()) {
            (Operator::In, Some(values)) => labels
                .get(&self.key)
                .map(|v| values.contains(v))
                .unwrap_or(false),
            (Operator::NotIn, Some(values)) => labels
                .get(&self.key)
                .map(|v| !values.contains(v))
                .unwrap_or(true),
            (Operator::Exists, None) => labels.contains_key(&self.key),
            (Operator::DoesNotExist, None) => !labels.contains_key(&self.key),
            (operator, values) => {
                tracing::warn!(?operator, key = %self.key, ?values, "illegal match expression");
                false
            }
        }
    }
}
