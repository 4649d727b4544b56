//! DAG definition and run types.
//!
//! A [`DagDefinition`] is the static shape of a workflow: a list of [`Step`]s,
//! where parallel and conditional steps carry [`Branch`]es and loop steps
//! carry a body. A [`DagInstance`] is one execution of a definition and owns
//! the run-scoped [`ShareData`] blackboard.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::key::ShareKey;

/// Operator name of a parallel fan-out step.
pub const PARALLEL_OPERATOR: &str = "@control/flow/parallel";
/// Operator name of a conditional-branch step.
pub const BRANCH_OPERATOR: &str = "@control/flow/branches";
/// Operator name of a loop step.
pub const LOOP_OPERATOR: &str = "@control/flow/loop";

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

/// What a step (and the tasks bound to it) does.
///
/// Serialized as a plain operator string so definitions stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    /// Ordinary action, e.g. `@internal/http/request`.
    Action(String),
    Parallel,
    Branch,
    Loop,
}

impl Operator {
    pub fn action(name: impl Into<String>) -> Self {
        Operator::Action(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operator::Action(name) => name,
            Operator::Parallel => PARALLEL_OPERATOR,
            Operator::Branch => BRANCH_OPERATOR,
            Operator::Loop => LOOP_OPERATOR,
        }
    }

    /// Parallel and conditional steps fan out into branches.
    pub fn has_branches(&self) -> bool {
        matches!(self, Operator::Parallel | Operator::Branch)
    }
}

impl From<String> for Operator {
    fn from(value: String) -> Self {
        match value.as_str() {
            PARALLEL_OPERATOR => Operator::Parallel,
            BRANCH_OPERATOR => Operator::Branch,
            LOOP_OPERATOR => Operator::Loop,
            _ => Operator::Action(value),
        }
    }
}

impl From<&str> for Operator {
    fn from(value: &str) -> Self {
        Operator::from(value.to_string())
    }
}

impl From<Operator> for String {
    fn from(value: Operator) -> Self {
        match value {
            Operator::Action(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Step / Branch
// ---------------------------------------------------------------------------

/// A node in the static DAG definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within its enclosing step list.
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Branches of a parallel or conditional step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
    /// Body of a loop step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

impl Step {
    pub fn new(id: impl Into<String>, operator: Operator) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            operator,
            parameters: serde_json::Map::new(),
            branches: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn action(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, Operator::action(name))
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_branches(mut self, branches: Vec<Branch>) -> Self {
        self.branches = branches;
        self
    }

    pub fn with_body(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Depth-first search through branches and loop bodies.
    pub fn find(&self, id: &str) -> Option<&Step> {
        if self.id == id {
            return Some(self);
        }
        find_in(&self.steps, id).or_else(|| self.branches.iter().find_map(|b| find_in(&b.steps, id)))
    }
}

/// One branch of a parallel or conditional step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    #[serde(default)]
    pub id: String,
    /// Condition groups for conditional branches; opaque to the engine.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub conditions: serde_json::Value,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Branch {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    pub fn with_conditions(mut self, conditions: serde_json::Value) -> Self {
        self.conditions = conditions;
        self
    }

    /// Condition groups as a list; a single non-array condition is one group.
    pub fn condition_groups(&self) -> Vec<serde_json::Value> {
        match &self.conditions {
            serde_json::Value::Null => Vec::new(),
            serde_json::Value::Array(groups) => groups.clone(),
            other => vec![other.clone()],
        }
    }
}

fn find_in<'a>(steps: &'a [Step], id: &str) -> Option<&'a Step> {
    steps.iter().find_map(|s| s.find(id))
}

// ---------------------------------------------------------------------------
// DagDefinition
// ---------------------------------------------------------------------------

/// The static shape of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub steps: Vec<Step>,
}

impl DagDefinition {
    pub fn from_yaml(input: &str) -> Result<Self, serde_yaml_ng::Error> {
        serde_yaml_ng::from_str(input)
    }

    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    /// Find a step anywhere in the definition, including nested bodies.
    pub fn find_step(&self, id: &str) -> Option<&Step> {
        find_in(&self.steps, id)
    }
}

// ---------------------------------------------------------------------------
// ShareData / DagInstance
// ---------------------------------------------------------------------------

/// Run-scoped key-value blackboard.
///
/// Cloning is cheap and every clone observes the same entries. Writers are
/// expected to use disjoint keys; see [`ShareKey`] for the namespace.
#[derive(Clone, Default)]
pub struct ShareData {
    entries: Arc<DashMap<String, serde_json::Value>>,
}

impl ShareData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ShareKey) -> Option<serde_json::Value> {
        self.get_raw(&key.to_string())
    }

    pub fn get_raw(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    pub fn contains(&self, key: &ShareKey) -> bool {
        self.entries.contains_key(&key.to_string())
    }

    pub fn set(&self, key: &ShareKey, value: impl Into<serde_json::Value>) {
        self.set_raw(key.to_string(), value);
    }

    pub fn set_raw(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Insert `field` into the object stored under `key`, creating the object
    /// (or replacing a non-object value) as needed.
    pub fn merge_field(&self, key: &ShareKey, field: &str, value: serde_json::Value) {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if !entry.is_object() {
            *entry = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = entry.as_object_mut() {
            map.insert(field.to_string(), value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted point-in-time copy of all entries.
    pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

impl fmt::Debug for ShareData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareData")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Serialize for ShareData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ShareData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = HashMap::<String, serde_json::Value>::deserialize(deserializer)?;
        Ok(Self {
            entries: Arc::new(map.into_iter().collect()),
        })
    }
}

/// One running execution of a DAG definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DagInstance {
    pub id: String,
    #[serde(default)]
    pub dag_id: String,
    #[serde(default)]
    pub share_data: ShareData,
}

impl DagInstance {
    pub fn new(id: impl Into<String>, dag_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dag_id: dag_id.into(),
            share_data: ShareData::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_yaml() -> &'static str {
        r#"
id: dag-1
name: nightly
steps:
  - id: "0"
    title: trigger
    operator: "@trigger/manual"
  - id: "1010"
    title: repeat
    operator: "@control/flow/loop"
    parameters:
      mode: array
      array: [a, b]
    steps:
      - id: "1"
        operator: "@control/flow/branches"
        branches:
          - conditions: [[{ op: eq, left: 1, right: 1 }]]
            steps:
              - id: "2"
                title: inner
                operator: "@internal/noop"
"#
    }

    #[test]
    fn operator_string_roundtrip() {
        assert_eq!(Operator::from(LOOP_OPERATOR), Operator::Loop);
        assert_eq!(Operator::from("@internal/noop"), Operator::action("@internal/noop"));
        let json = serde_json::to_string(&Operator::Parallel).unwrap();
        assert_eq!(json, format!("\"{PARALLEL_OPERATOR}\""));
        assert!(Operator::Branch.has_branches());
        assert!(!Operator::Loop.has_branches());
    }

    #[test]
    fn definition_parses_nested_yaml() {
        let dag = DagDefinition::from_yaml(sample_yaml()).unwrap();
        assert_eq!(dag.steps.len(), 2);
        let lp = &dag.steps[1];
        assert_eq!(lp.operator, Operator::Loop);
        assert_eq!(lp.parameters["mode"], json!("array"));
        assert_eq!(lp.steps[0].branches[0].condition_groups().len(), 1);
    }

    #[test]
    fn find_step_searches_bodies_and_branches() {
        let dag = DagDefinition::from_yaml(sample_yaml()).unwrap();
        assert_eq!(dag.find_step("2").unwrap().title, "inner");
        assert_eq!(dag.find_step("1010").unwrap().title, "repeat");
        assert!(dag.find_step("missing").is_none());
    }

    #[test]
    fn share_data_clones_share_entries() {
        let share = ShareData::new();
        let other = share.clone();
        other.set(&ShareKey::LoopIndex("1010".into()), 2);
        assert_eq!(share.get(&ShareKey::LoopIndex("1010".into())), Some(json!(2)));
        assert_eq!(share.len(), 1);
    }

    #[test]
    fn share_data_merge_field_keeps_siblings() {
        let share = ShareData::new();
        let key = ShareKey::LoopScope("1010".into());
        share.set(&key, json!({ "index": 1 }));
        share.merge_field(&key, "outputs", json!({ "x": [1] }));
        assert_eq!(share.get(&key), Some(json!({ "index": 1, "outputs": { "x": [1] } })));
    }

    #[test]
    fn share_data_serializes_as_sorted_object() {
        let share = ShareData::new();
        share.set_raw("b", 2);
        share.set_raw("a", 1);
        assert_eq!(serde_json::to_string(&share).unwrap(), r#"{"a":1,"b":2}"#);
        let parsed: ShareData = serde_json::from_str(r#"{"x":true}"#).unwrap();
        assert_eq!(parsed.get_raw("x"), Some(json!(true)));
    }
}
