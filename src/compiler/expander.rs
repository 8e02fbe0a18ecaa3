use crate::dsl::{ConditionSpec, NetDefinition};
use std::collections::HashSet;

pub struct Expander {
    // 无状态：隐式条件名由两端任务名确定
}

impl Expander {
    pub fn new() -> Self {
        Self {}
    }

    pub fn implicit_condition_name(from: &str, to: &str) -> String {
        format!("implicit:{}->{}", from, to)
    }

    /// Rewrites every direct task -> task flow into task -> implicit condition -> task.
    pub fn expand(&self, definition: NetDefinition) -> NetDefinition {
        let task_names: HashSet<String> = definition.tasks.iter().map(|t| t.name.clone()).collect();
        let condition_names: HashSet<String> =
            definition.conditions.iter().map(|c| c.name.clone()).collect();

        let mut conditions = definition.conditions;
        let mut flows_from_conditions = definition.flows_from_conditions;
        let mut flows_from_tasks = definition.flows_from_tasks;

        for (from, flows) in flows_from_tasks.iter_mut() {
            for flow in flows.iter_mut() {
                if condition_names.contains(&flow.to) || !task_names.contains(&flow.to) {
                    // Unknown targets are left for the compiler to report.
                    continue;
                }
                let target = flow.to.clone();
                let implicit = Self::implicit_condition_name(from, &target);
                if !conditions.iter().any(|c| c.name == implicit) {
                    conditions.push(ConditionSpec {
                        name: implicit.clone(),
                        is_implicit: true,
                    });
                }
                let consumers = flows_from_conditions.entry(implicit.clone()).or_default();
                if !consumers.contains(&target) {
                    consumers.push(target);
                }
                flow.to = implicit;
            }
        }

        NetDefinition {
            conditions,
            flows_from_conditions,
            flows_from_tasks,
            ..definition
        }
    }
}

impl Default for Expander {
    fn default() -> Self {
        Self::new()
    }
}
