use std::collections::BTreeMap;
use evalexpr::{
    build_operator_tree, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext,
    Node as EvalNode,
};
use serde_json::{Map, Value};
use tracing::warn;

use crate::dsl::{JoinType, SplitType};
use crate::error::{EngineError, EntityKind, Result};

/// 编译后的工作流网 (不可变，同一定义的所有实例共享)
#[derive(Debug, Clone)]
pub struct NetModel {
    pub id: String,
    pub name: String,
    pub tasks: BTreeMap<String, TaskDef>,
    pub conditions: BTreeMap<String, ConditionDef>,
    pub start_condition: String,
    pub end_condition: String,
}

impl NetModel {
    pub fn task(&self, name: &str) -> Result<&TaskDef> {
        self.tasks
            .get(name)
            .ok_or_else(|| EngineError::not_found(EntityKind::Task, name))
    }

    pub fn condition(&self, name: &str) -> Result<&ConditionDef> {
        self.conditions
            .get(name)
            .ok_or_else(|| EngineError::not_found(EntityKind::Condition, name))
    }

    pub fn or_join_tasks(&self) -> impl Iterator<Item = &TaskDef> {
        self.tasks.values().filter(|t| t.join_type == JoinType::Or)
    }

    /// Nets referenced by composite tasks.
    pub fn subnets(&self) -> impl Iterator<Item = &str> {
        self.tasks.values().filter_map(|t| t.subnet.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct TaskDef {
    pub name: String,
    pub split_type: SplitType,
    pub join_type: JoinType,
    /// Input conditions (Condition -> Task flows).
    pub preset: Vec<String>,
    /// Output flows in declaration order.
    pub flows: Vec<Flow>,
    pub cancellation_region: CancellationRegion,
    pub subnet: Option<String>,
    pub activity: Option<String>,
    pub params: Value,
}

impl TaskDef {
    pub fn postset(&self) -> impl Iterator<Item = &str> {
        self.flows.iter().map(|f| f.condition.as_str())
    }

    pub fn is_composite(&self) -> bool {
        self.subnet.is_some()
    }

    /// Flows in XOR evaluation order: ascending `order` (unset last), ties by
    /// declaration, default flows after every ordered flow.
    pub fn xor_order(&self) -> Vec<&Flow> {
        let mut flows: Vec<&Flow> = self.flows.iter().collect();
        flows.sort_by_key(|f| (f.is_default, f.order.unwrap_or(i64::MAX), f.position));
        flows
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancellationRegion {
    pub tasks: Vec<String>,
    pub conditions: Vec<String>,
}

impl CancellationRegion {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.conditions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ConditionDef {
    pub name: String,
    pub implicit: bool,
    /// Producer tasks.
    pub preset: Vec<String>,
    /// Consumer tasks.
    pub postset: Vec<String>,
}

/// Task -> Condition edge.
#[derive(Debug, Clone)]
pub struct Flow {
    pub condition: String,
    pub order: Option<i64>,
    pub predicate: Option<Predicate>,
    pub is_default: bool,
    pub position: usize,
}

impl Flow {
    /// An unconditional flow always admits a token.
    pub fn admits(&self, vars: &Map<String, Value>) -> bool {
        match &self.predicate {
            Some(p) => p.evaluate(vars),
            None => true,
        }
    }
}

/// Pre-compiled flow predicate over workflow variables.
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    node: EvalNode<DefaultNumericTypes>,
}

impl Predicate {
    pub fn compile(source: &str) -> Result<Self> {
        let clean = source.replace("${", "").replace('}', "");
        let node = build_operator_tree::<DefaultNumericTypes>(&clean).map_err(|e| {
            EngineError::NetConsistency(format!("invalid predicate '{}': {}", source, e))
        })?;
        Ok(Self {
            source: source.to_string(),
            node,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluation errors (unknown variable, type mismatch) count as false.
    pub fn evaluate(&self, vars: &Map<String, Value>) -> bool {
        let eval_ctx = eval_context(vars);
        self.node
            .eval_boolean_with_context(&eval_ctx)
            .unwrap_or_else(|e| {
                warn!(predicate = %self.source, error = %e, "Predicate evaluation failed");
                false
            })
    }
}

pub(crate) fn eval_context(vars: &Map<String, Value>) -> HashMapContext<DefaultNumericTypes> {
    let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (k, v) in vars {
        if let Some(ev) = to_eval_value(v) {
            let _ = eval_ctx.set_value(k.clone(), ev);
        }
    }
    eval_ctx
}

pub(crate) fn to_eval_value(v: &Value) -> Option<evalexpr::Value<DefaultNumericTypes>> {
    match v {
        Value::String(s) => Some(evalexpr::Value::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(evalexpr::Value::Int(i))
            } else {
                n.as_f64().map(evalexpr::Value::Float)
            }
        }
        Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
        _ => None,
    }
}

pub(crate) fn from_eval_value(v: evalexpr::Value<DefaultNumericTypes>) -> Option<Value> {
    match v {
        evalexpr::Value::String(s) => Some(Value::String(s)),
        evalexpr::Value::Int(i) => Some(Value::from(i)),
        evalexpr::Value::Float(f) => serde_json::Number::from_f64(f).map(Value::Number),
        evalexpr::Value::Boolean(b) => Some(Value::Bool(b)),
        _ => None,
    }
}
