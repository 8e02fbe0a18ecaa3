use crate::compiler::expander::Expander;
use crate::dsl::NetDefinition;
use crate::error::{EngineError, Result};
use crate::runtime::net::{CancellationRegion, ConditionDef, Flow, NetModel, Predicate, TaskDef};
use std::collections::{BTreeMap, HashSet};

/// 将 NetDefinition 校验并编译为不可变的 NetModel
pub struct Compiler;

fn inconsistent(msg: String) -> EngineError {
    EngineError::NetConsistency(msg)
}

impl Compiler {
    pub fn new() -> Self {
        Self
    }

    pub fn compile(&self, raw: NetDefinition) -> Result<NetModel> {
        // 0. Pass 0: implicit conditions
        let definition = Expander::new().expand(raw);

        // 1. Pass 1: Indexing
        let mut task_names = HashSet::new();
        for task in &definition.tasks {
            if !task_names.insert(task.name.as_str()) {
                return Err(inconsistent(format!("duplicate task: {}", task.name)));
            }
        }
        let mut condition_names = HashSet::new();
        for condition in &definition.conditions {
            if task_names.contains(condition.name.as_str()) {
                return Err(inconsistent(format!(
                    "name used by both a task and a condition: {}",
                    condition.name
                )));
            }
            if !condition_names.insert(condition.name.as_str()) {
                return Err(inconsistent(format!("duplicate condition: {}", condition.name)));
            }
        }
        for (label, name) in [
            ("start", &definition.start_condition),
            ("end", &definition.end_condition),
        ] {
            if !condition_names.contains(name.as_str()) {
                return Err(inconsistent(format!("{} condition not declared: {}", label, name)));
            }
        }
        if definition.start_condition == definition.end_condition {
            return Err(inconsistent("start and end condition must differ".to_string()));
        }

        // 2. Pass 2: Conditions and their consumers
        let mut conditions: BTreeMap<String, ConditionDef> = definition
            .conditions
            .iter()
            .map(|c| {
                (c.name.clone(), ConditionDef {
                    name: c.name.clone(),
                    implicit: c.is_implicit,
                    preset: Vec::new(),
                    postset: Vec::new(),
                })
            })
            .collect();
        let mut task_presets: BTreeMap<&str, Vec<String>> = BTreeMap::new();

        for (condition, consumers) in &definition.flows_from_conditions {
            let def = conditions
                .get_mut(condition)
                .ok_or_else(|| inconsistent(format!("flow from unknown condition: {}", condition)))?;
            for task in consumers {
                if !task_names.contains(task.as_str()) {
                    return Err(inconsistent(format!(
                        "flow from {} to unknown task: {}",
                        condition, task
                    )));
                }
                if !def.postset.contains(task) {
                    def.postset.push(task.clone());
                    task_presets.entry(task.as_str()).or_default().push(condition.clone());
                }
            }
        }

        // 3. Pass 3: Tasks and their outgoing flows
        for from in definition.flows_from_tasks.keys() {
            if !task_names.contains(from.as_str()) {
                return Err(inconsistent(format!("flow from unknown task: {}", from)));
            }
        }
        for from in definition.cancellation_regions.keys() {
            if !task_names.contains(from.as_str()) {
                return Err(inconsistent(format!("cancellation region on unknown task: {}", from)));
            }
        }

        let mut tasks = BTreeMap::new();
        for spec in &definition.tasks {
            let mut flows = Vec::new();
            for (position, flow) in definition
                .flows_from_tasks
                .get(&spec.name)
                .map(|v| v.as_slice())
                .unwrap_or(&[])
                .iter()
                .enumerate()
            {
                let condition = conditions.get_mut(&flow.to).ok_or_else(|| {
                    inconsistent(format!("flow from {} to unknown target: {}", spec.name, flow.to))
                })?;
                if flows.iter().any(|f: &Flow| f.condition == flow.to) {
                    return Err(inconsistent(format!(
                        "duplicate flow from {} to {}",
                        spec.name, flow.to
                    )));
                }
                condition.preset.push(spec.name.clone());
                let predicate = flow.predicate.as_deref().map(Predicate::compile).transpose()?;
                flows.push(Flow {
                    condition: flow.to.clone(),
                    order: flow.order,
                    predicate,
                    is_default: flow.is_default,
                    position,
                });
            }

            let preset = task_presets.remove(spec.name.as_str()).unwrap_or_default();
            if preset.is_empty() {
                return Err(inconsistent(format!("task has no input condition: {}", spec.name)));
            }

            let cancellation_region = match definition.cancellation_regions.get(&spec.name) {
                Some(region) => {
                    for t in &region.tasks {
                        if !task_names.contains(t.as_str()) {
                            return Err(inconsistent(format!(
                                "cancellation region of {} names unknown task: {}",
                                spec.name, t
                            )));
                        }
                    }
                    for c in &region.conditions {
                        if !condition_names.contains(c.as_str()) {
                            return Err(inconsistent(format!(
                                "cancellation region of {} names unknown condition: {}",
                                spec.name, c
                            )));
                        }
                    }
                    CancellationRegion {
                        tasks: region.tasks.clone(),
                        conditions: region.conditions.clone(),
                    }
                }
                None => CancellationRegion::default(),
            };

            tasks.insert(spec.name.clone(), TaskDef {
                name: spec.name.clone(),
                split_type: spec.split_type.unwrap_or_default(),
                join_type: spec.join_type.unwrap_or_default(),
                preset,
                flows,
                cancellation_region,
                subnet: spec.subnet.clone(),
                activity: spec.activity.clone(),
                params: spec.params.clone(),
            });
        }

        Ok(NetModel {
            name: definition.name.clone().unwrap_or_else(|| definition.id.clone()),
            id: definition.id,
            tasks,
            conditions,
            start_condition: definition.start_condition,
            end_condition: definition.end_condition,
        })
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}
