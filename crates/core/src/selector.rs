//! Label selectors: matching against machine labels and rendering for list calls.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("selector requirement has an empty key")]
    EmptyKey,
    #[error("operator {op} on {key:?} requires at least one value")]
    MissingValues { key: String, op: String },
    #[error("operator {op} on {key:?} takes no values")]
    UnexpectedValues { key: String, op: String },
    #[error("unknown selector operator {0:?}")]
    UnknownOperator(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Equals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub op: Operator,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let v = labels.get(&self.key);
        match &self.op {
            Operator::Equals(want) => v == Some(want),
            Operator::In(set) => v.map(|v| set.contains(v)).unwrap_or(false),
            Operator::NotIn(set) => v.map(|v| !set.contains(v)).unwrap_or(true),
            Operator::Exists => v.is_some(),
            Operator::DoesNotExist => v.is_none(),
        }
    }
}

/// Conjunction of requirements; the empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    /// Build from `matchLabels` plus `(key, operator, values)` expressions.
    pub fn from_parts<'a>(
        match_labels: impl IntoIterator<Item = (&'a str, &'a str)>,
        expressions: impl IntoIterator<Item = (&'a str, &'a str, &'a [String])>,
    ) -> Result<Self, SelectorError> {
        let mut requirements = Vec::new();
        for (k, v) in match_labels {
            if k.is_empty() {
                return Err(SelectorError::EmptyKey);
            }
            requirements.push(Requirement { key: k.to_string(), op: Operator::Equals(v.to_string()) });
        }
        for (key, op, values) in expressions {
            if key.is_empty() {
                return Err(SelectorError::EmptyKey);
            }
            let set: BTreeSet<String> = values.iter().cloned().collect();
            let op = match op {
                "In" | "NotIn" if set.is_empty() => {
                    return Err(SelectorError::MissingValues { key: key.to_string(), op: op.to_string() })
                }
                "Exists" | "DoesNotExist" if !set.is_empty() => {
                    return Err(SelectorError::UnexpectedValues { key: key.to_string(), op: op.to_string() })
                }
                "In" => Operator::In(set),
                "NotIn" => Operator::NotIn(set),
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                other => return Err(SelectorError::UnknownOperator(other.to_string())),
            };
            requirements.push(Requirement { key: key.to_string(), op });
        }
        Ok(Self { requirements })
    }

    /// Copy of this selector that additionally requires `key` to exist.
    pub fn and_exists(&self, key: &str) -> Self {
        let mut out = self.clone();
        out.requirements.push(Requirement { key: key.to_string(), op: Operator::Exists });
        out
    }

    pub fn is_everything(&self) -> bool { self.requirements.is_empty() }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

/// Renders the wire syntax accepted by list calls, e.g. `a=b,c in (x,y),!d,e`.
impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|r| match &r.op {
                Operator::Equals(v) => format!("{}={}", r.key, v),
                Operator::In(set) => format!("{} in ({})", r.key, set.iter().cloned().collect::<Vec<_>>().join(",")),
                Operator::NotIn(set) => format!("{} notin ({})", r.key, set.iter().cloned().collect::<Vec<_>>().join(",")),
                Operator::Exists => r.key.clone(),
                Operator::DoesNotExist => format!("!{}", r.key),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}
