pub mod builder;

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use serde_json::Value;

/// 原始网定义 (由 builder 或 YAML 产生，编译后得到 NetModel)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
    /// task -> outgoing flows (to a condition, or directly to a task)
    #[serde(default)]
    pub flows_from_tasks: BTreeMap<String, Vec<TaskFlowSpec>>,
    /// condition -> consuming tasks
    #[serde(default)]
    pub flows_from_conditions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub cancellation_regions: BTreeMap<String, CancellationRegionSpec>,
    pub start_condition: String,
    pub end_condition: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SplitType {
    #[default]
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    #[default]
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub split_type: Option<SplitType>,
    #[serde(default)]
    pub join_type: Option<JoinType>,
    /// Id of a registered net; makes this a composite task.
    #[serde(default)]
    pub subnet: Option<String>,
    /// Name of a registered activity invoked on fire/complete.
    #[serde(default)]
    pub activity: Option<String>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionSpec {
    pub name: String,
    #[serde(default)]
    pub is_implicit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskFlowSpec {
    pub to: String,
    #[serde(default)]
    pub order: Option<i64>,
    /// evalexpr boolean expression over workflow variables
    #[serde(default)]
    pub predicate: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CancellationRegionSpec {
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
}
