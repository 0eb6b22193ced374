//! Node records and node selectors
//!
//! A node is the candidate the allocator evaluates. Slices pin their devices
//! to nodes either by name or by a node selector, and allocation results carry
//! a node selector describing where the chosen devices are reachable.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only field key supported in `matchFields`
pub const NODE_NAME_FIELD: &str = "metadata.name";

/// A candidate node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: NodeMetadata,
}

/// Metadata for a Node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Unique name for this node
    pub name: String,

    /// Labels for node selection
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Node {
    /// Create a node without labels
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: NodeMetadata {
                name: name.into(),
                labels: HashMap::new(),
            },
        }
    }

    /// Add a label (builder style)
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Errors when evaluating a node selector
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeSelectorError {
    #[error("Field selector key '{0}' is not supported, only 'metadata.name'")]
    UnsupportedField(String),

    #[error("Operator {operator:?} on key '{key}' requires {expected}")]
    InvalidValues {
        key: String,
        operator: NodeSelectorOperator,
        expected: &'static str,
    },
}

/// A set of alternative terms; a node matches if any term matches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelector {
    #[serde(rename = "nodeSelectorTerms")]
    #[serde(default)]
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

/// Requirements that must all hold
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelectorTerm {
    /// Requirements against node labels
    #[serde(rename = "matchExpressions")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<NodeSelectorRequirement>,

    /// Requirements against node fields
    #[serde(rename = "matchFields")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<NodeSelectorRequirement>,
}

/// One requirement: key, operator, values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: NodeSelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Operators understood by node selector requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

impl NodeSelector {
    /// A selector that only matches the node with the given name
    pub fn for_node_name(name: impl Into<String>) -> Self {
        Self {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Vec::new(),
                match_fields: vec![NodeSelectorRequirement::new(
                    NODE_NAME_FIELD,
                    NodeSelectorOperator::In,
                    [name.into()],
                )],
            }],
        }
    }

    /// Check whether the node satisfies at least one term
    pub fn matches(&self, node: &Node) -> Result<bool, NodeSelectorError> {
        for term in &self.node_selector_terms {
            if term.matches(node)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl NodeSelectorTerm {
    /// Check whether every requirement holds. An empty term matches nothing.
    pub fn matches(&self, node: &Node) -> Result<bool, NodeSelectorError> {
        if self.is_empty() {
            return Ok(false);
        }
        for requirement in &self.match_expressions {
            let value = node.metadata.labels.get(&requirement.key).map(String::as_str);
            if !requirement.matches_value(value)? {
                return Ok(false);
            }
        }
        for requirement in &self.match_fields {
            if requirement.key != NODE_NAME_FIELD {
                return Err(NodeSelectorError::UnsupportedField(requirement.key.clone()));
            }
            if !requirement.matches_value(Some(node.name()))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.match_expressions.is_empty() && self.match_fields.is_empty()
    }
}

impl NodeSelectorRequirement {
    pub fn new<I, S>(key: impl Into<String>, operator: NodeSelectorOperator, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluate against the value found under `key`, if any
    fn matches_value(&self, value: Option<&str>) -> Result<bool, NodeSelectorError> {
        match self.operator {
            NodeSelectorOperator::In => Ok(value.is_some_and(|v| self.values.iter().any(|x| x == v))),
            NodeSelectorOperator::NotIn => {
                Ok(!value.is_some_and(|v| self.values.iter().any(|x| x == v)))
            }
            NodeSelectorOperator::Exists => Ok(value.is_some()),
            NodeSelectorOperator::DoesNotExist => Ok(value.is_none()),
            NodeSelectorOperator::Gt | NodeSelectorOperator::Lt => {
                let bound = self.integer_bound()?;
                let Some(actual) = value.and_then(|v| v.parse::<i64>().ok()) else {
                    return Ok(false);
                };
                Ok(match self.operator {
                    NodeSelectorOperator::Gt => actual > bound,
                    _ => actual < bound,
                })
            }
        }
    }

    fn integer_bound(&self) -> Result<i64, NodeSelectorError> {
        let invalid = || NodeSelectorError::InvalidValues {
            key: self.key.clone(),
            operator: self.operator,
            expected: "exactly one integer value",
        };
        match self.values.as_slice() {
            [single] => single.parse().map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }

    /// Same key, operator and value set (order and duplicates ignored)
    pub fn is_equivalent(&self, other: &NodeSelectorRequirement) -> bool {
        if self.key != other.key || self.operator != other.operator {
            return false;
        }
        let mine: BTreeSet<&str> = self.values.iter().map(String::as_str).collect();
        let theirs: BTreeSet<&str> = other.values.iter().map(String::as_str).collect();
        mine == theirs
    }
}
