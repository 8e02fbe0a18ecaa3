use crate::dsl::{
    CancellationRegionSpec, ConditionSpec, JoinType, NetDefinition, SplitType, TaskFlowSpec,
    TaskSpec,
};
use std::collections::BTreeMap;
use serde_json::{Map, Value};

pub struct NetBuilder {
    id: String,
    name: Option<String>,
    pub tasks: Vec<TaskSpec>, // public so tests can tweak specs in place
    conditions: Vec<ConditionSpec>,
    flows_from_tasks: BTreeMap<String, Vec<TaskFlowSpec>>,
    flows_from_conditions: BTreeMap<String, Vec<String>>,
    cancellation_regions: BTreeMap<String, CancellationRegionSpec>,
    start_condition: String,
    end_condition: String,
}

impl NetBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            tasks: Vec::new(),
            conditions: Vec::new(),
            flows_from_tasks: BTreeMap::new(),
            flows_from_conditions: BTreeMap::new(),
            cancellation_regions: BTreeMap::new(),
            start_condition: "start".to_string(),
            end_condition: "end".to_string(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// 声明起始条件 (build 时自动注册为 condition)
    pub fn start_condition(mut self, name: &str) -> Self {
        self.start_condition = name.to_string();
        self
    }

    pub fn end_condition(mut self, name: &str) -> Self {
        self.end_condition = name.to_string();
        self
    }

    pub fn condition(mut self, name: &str) -> Self {
        if !self.conditions.iter().any(|c| c.name == name) {
            self.conditions.push(ConditionSpec {
                name: name.to_string(),
                is_implicit: false,
            });
        }
        self
    }

    /// Plain AND-join/AND-split task with no activity.
    pub fn atomic(self, name: &str) -> Self {
        self.task(name).build()
    }

    pub fn task(self, name: &str) -> TaskBuilder {
        TaskBuilder {
            net_builder: self,
            name: name.to_string(),
            split_type: None,
            join_type: None,
            subnet: None,
            activity: None,
            params: Map::new(),
        }
    }

    /// Condition -> task.
    pub fn consume(mut self, condition: &str, task: &str) -> Self {
        self.flows_from_conditions
            .entry(condition.to_string())
            .or_default()
            .push(task.to_string());
        self
    }

    /// Task -> condition (or task -> task, which compiles to an implicit condition).
    pub fn connect(self, task: &str, to: &str) -> Self {
        self.push_flow(task, TaskFlowSpec {
            to: to.to_string(),
            order: None,
            predicate: None,
            is_default: false,
        })
    }

    pub fn connect_if(self, task: &str, to: &str, predicate: &str) -> Self {
        self.push_flow(task, TaskFlowSpec {
            to: to.to_string(),
            order: None,
            predicate: Some(predicate.to_string()),
            is_default: false,
        })
    }

    pub fn connect_ordered(self, task: &str, to: &str, order: i64, predicate: &str) -> Self {
        self.push_flow(task, TaskFlowSpec {
            to: to.to_string(),
            order: Some(order),
            predicate: Some(predicate.to_string()),
            is_default: false,
        })
    }

    pub fn connect_default(self, task: &str, to: &str) -> Self {
        self.push_flow(task, TaskFlowSpec {
            to: to.to_string(),
            order: None,
            predicate: None,
            is_default: true,
        })
    }

    pub fn cancel_region(mut self, task: &str, tasks: &[&str], conditions: &[&str]) -> Self {
        let region = self.cancellation_regions.entry(task.to_string()).or_default();
        region.tasks.extend(tasks.iter().map(|s| s.to_string()));
        region.conditions.extend(conditions.iter().map(|s| s.to_string()));
        self
    }

    fn push_flow(mut self, task: &str, flow: TaskFlowSpec) -> Self {
        self.flows_from_tasks
            .entry(task.to_string())
            .or_default()
            .push(flow);
        self
    }

    pub fn build(self) -> NetDefinition {
        let start = self.start_condition.clone();
        let end = self.end_condition.clone();
        let this = self.condition(&start).condition(&end);
        this.finish()
    }

    fn finish(self) -> NetDefinition {
        NetDefinition {
            id: self.id,
            name: self.name,
            tasks: self.tasks,
            conditions: self.conditions,
            flows_from_tasks: self.flows_from_tasks,
            flows_from_conditions: self.flows_from_conditions,
            cancellation_regions: self.cancellation_regions,
            start_condition: self.start_condition,
            end_condition: self.end_condition,
        }
    }
}

pub struct TaskBuilder {
    net_builder: NetBuilder,
    name: String,
    split_type: Option<SplitType>,
    join_type: Option<JoinType>,
    subnet: Option<String>,
    activity: Option<String>,
    params: Map<String, Value>,
}

impl TaskBuilder {
    pub fn split(mut self, split_type: SplitType) -> Self {
        self.split_type = Some(split_type);
        self
    }

    pub fn join(mut self, join_type: JoinType) -> Self {
        self.join_type = Some(join_type);
        self
    }

    /// 复合任务：触发时实例化子工作流
    pub fn subnet(mut self, net_id: &str) -> Self {
        self.subnet = Some(net_id.to_string());
        self
    }

    pub fn activity(mut self, name: &str) -> Self {
        self.activity = Some(name.to_string());
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn build(mut self) -> NetBuilder {
        let params = if self.params.is_empty() {
            Value::Null
        } else {
            Value::Object(self.params)
        };
        self.net_builder.tasks.push(TaskSpec {
            name: self.name,
            split_type: self.split_type,
            join_type: self.join_type,
            subnet: self.subnet,
            activity: self.activity,
            params,
        });
        self.net_builder
    }
}
