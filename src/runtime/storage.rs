use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{EngineError, EntityKind, Result};

// --- States ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Running,
    Completed,
    Canceled,
    Failed,
}

impl WorkflowState {
    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        matches!(
            (self, next),
            (WorkflowState::Running, WorkflowState::Completed)
                | (WorkflowState::Running, WorkflowState::Canceled)
                | (WorkflowState::Running, WorkflowState::Failed)
        )
    }

    pub fn is_final(self) -> bool {
        self != WorkflowState::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Disabled,
    Enabled,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    /// 任务状态机；表外的迁移一律非法
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Disabled, Enabled)
                | (Enabled, Active)
                | (Enabled, Disabled)
                | (Active, Completed)
                | (Active, Cancelled)
                | (Active, Failed)
                | (Completed, Enabled)
                | (Cancelled, Enabled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemState {
    Initialized,
    Started,
    Completed,
    Canceled,
    Failed,
}

impl WorkItemState {
    pub fn can_transition_to(self, next: WorkItemState) -> bool {
        use WorkItemState::*;
        matches!(
            (self, next),
            (Initialized, Started)
                | (Initialized, Canceled)
                | (Initialized, Failed)
                | (Started, Completed)
                | (Started, Canceled)
                | (Started, Failed)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            WorkItemState::Completed | WorkItemState::Canceled | WorkItemState::Failed
        )
    }
}

// --- Records ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub workflow_id: String,
    pub task: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    /// Id of the net this instance runs.
    pub name: String,
    pub state: WorkflowState,
    #[serde(default)]
    pub parent: Option<ParentRef>,
    #[serde(default)]
    pub vars: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    pub state: TaskState,
    /// Number of activations so far.
    #[serde(default)]
    pub generation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionRecord {
    pub name: String,
    pub marking: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemRecord {
    pub id: String,
    pub task_name: String,
    pub generation: u32,
    pub state: WorkItemState,
    #[serde(default)]
    pub payload: Value,
}

/// Store-level persistable form of an instance and all of its nested instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow: WorkflowRecord,
    pub tasks: Vec<TaskRecord>,
    pub conditions: Vec<ConditionRecord>,
    pub work_items: Vec<WorkItemRecord>,
    #[serde(default)]
    pub children: Vec<WorkflowSnapshot>,
}

// --- Interface ---

/// 每个实例的全部可变状态都存放在这里；Condition/Task 只是读写协调者
#[async_trait]
pub trait StateStore: Send + Sync {
    // ── Workflows ──

    async fn create_workflow(&self, record: WorkflowRecord) -> Result<()>;
    async fn load_workflow(&self, id: &str) -> Result<WorkflowRecord>;
    /// Enforces `WorkflowState::can_transition_to`.
    async fn update_workflow_state(&self, id: &str, state: WorkflowState) -> Result<()>;
    async fn get_vars(&self, id: &str) -> Result<Map<String, Value>>;
    async fn set_vars(&self, id: &str, vars: Map<String, Value>) -> Result<()>;
    /// Direct nested instances, sorted by id.
    async fn list_children(&self, id: &str) -> Result<Vec<WorkflowRecord>>;

    // ── Tasks ──

    async fn insert_task(&self, workflow_id: &str, record: TaskRecord) -> Result<()>;
    async fn load_task(&self, workflow_id: &str, task: &str) -> Result<TaskRecord>;
    /// Enforces `TaskState::can_transition_to`; entering `Active` bumps the generation.
    async fn update_task_state(&self, workflow_id: &str, task: &str, state: TaskState) -> Result<TaskRecord>;
    /// Sorted by name.
    async fn load_tasks(&self, workflow_id: &str) -> Result<Vec<TaskRecord>>;

    // ── Conditions ──

    async fn insert_condition(&self, workflow_id: &str, record: ConditionRecord) -> Result<()>;
    async fn marking(&self, workflow_id: &str, condition: &str) -> Result<u32>;
    /// Returns the new marking.
    async fn increment_marking(&self, workflow_id: &str, condition: &str) -> Result<u32>;
    /// Floors at zero. Returns the new marking.
    async fn decrement_marking(&self, workflow_id: &str, condition: &str) -> Result<u32>;
    async fn zero_marking(&self, workflow_id: &str, condition: &str) -> Result<()>;
    /// Sorted by name.
    async fn load_conditions(&self, workflow_id: &str) -> Result<Vec<ConditionRecord>>;

    // ── Work items ──

    async fn create_work_item(&self, workflow_id: &str, record: WorkItemRecord) -> Result<()>;
    async fn load_work_item(&self, workflow_id: &str, id: &str) -> Result<WorkItemRecord>;
    /// Enforces `WorkItemState::can_transition_to`.
    async fn update_work_item_state(&self, workflow_id: &str, id: &str, state: WorkItemState) -> Result<WorkItemRecord>;
    async fn set_work_item_payload(&self, workflow_id: &str, id: &str, payload: Value) -> Result<()>;
    /// Sorted by id.
    async fn load_work_items(&self, workflow_id: &str) -> Result<Vec<WorkItemRecord>>;

    async fn work_items_for_task(&self, workflow_id: &str, task: &str) -> Result<Vec<WorkItemRecord>> {
        let items = self.load_work_items(workflow_id).await?;
        Ok(items.into_iter().filter(|i| i.task_name == task).collect())
    }

    async fn work_items_in_state(&self, workflow_id: &str, state: WorkItemState) -> Result<Vec<WorkItemRecord>> {
        let items = self.load_work_items(workflow_id).await?;
        Ok(items.into_iter().filter(|i| i.state == state).collect())
    }

    // ── Snapshots ──

    async fn snapshot(&self, id: &str) -> Result<WorkflowSnapshot> {
        // Depth-first over nested instances, without async recursion.
        let mut order = vec![self.load_workflow(id).await?];
        let mut idx = 0;
        while idx < order.len() {
            let children = self.list_children(&order[idx].id).await?;
            order.extend(children);
            idx += 1;
        }

        let mut built: BTreeMap<String, WorkflowSnapshot> = BTreeMap::new();
        for record in order.into_iter().rev() {
            let tasks = self.load_tasks(&record.id).await?;
            let conditions = self.load_conditions(&record.id).await?;
            let work_items = self.load_work_items(&record.id).await?;
            let child_ids: Vec<String> = self
                .list_children(&record.id)
                .await?
                .into_iter()
                .map(|c| c.id)
                .collect();
            let children = child_ids
                .iter()
                .filter_map(|cid| built.remove(cid))
                .collect();
            built.insert(record.id.clone(), WorkflowSnapshot {
                workflow: record,
                tasks,
                conditions,
                work_items,
                children,
            });
        }
        built
            .remove(id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Workflow, id))
    }

    async fn restore(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        let mut pending = vec![snapshot];
        while let Some(snap) = pending.pop() {
            self.create_workflow(snap.workflow.clone()).await?;
            for task in &snap.tasks {
                self.insert_task(&snap.workflow.id, task.clone()).await?;
            }
            for condition in &snap.conditions {
                self.insert_condition(&snap.workflow.id, condition.clone()).await?;
            }
            for item in &snap.work_items {
                self.create_work_item(&snap.workflow.id, item.clone()).await?;
            }
            pending.extend(snap.children.iter());
        }
        Ok(())
    }
}

// --- In-Memory Implementation ---

#[derive(Default)]
struct InstanceState {
    tasks: BTreeMap<String, TaskRecord>,
    conditions: BTreeMap<String, u32>,
    work_items: BTreeMap<String, WorkItemRecord>,
}

pub struct InMemoryStateStore {
    workflows: DashMap<String, WorkflowRecord>,
    // Map<WorkflowId, per-instance tables>
    instances: DashMap<String, InstanceState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            workflows: DashMap::new(),
            instances: DashMap::new(),
        }
    }

    fn with_instance<T>(&self, workflow_id: &str, f: impl FnOnce(&mut InstanceState) -> Result<T>) -> Result<T> {
        let mut inst = self
            .instances
            .get_mut(workflow_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Workflow, workflow_id))?;
        f(inst.value_mut())
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_workflow(&self, record: WorkflowRecord) -> Result<()> {
        self.instances.entry(record.id.clone()).or_default();
        self.workflows.insert(record.id.clone(), record);
        Ok(())
    }

    async fn load_workflow(&self, id: &str) -> Result<WorkflowRecord> {
        self.workflows
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::Workflow, id))
    }

    async fn update_workflow_state(&self, id: &str, state: WorkflowState) -> Result<()> {
        let mut record = self
            .workflows
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Workflow, id))?;
        if !record.state.can_transition_to(state) {
            return Err(EngineError::invalid_transition(EntityKind::Workflow, id, record.state, state));
        }
        record.state = state;
        Ok(())
    }

    async fn get_vars(&self, id: &str) -> Result<Map<String, Value>> {
        Ok(self.load_workflow(id).await?.vars)
    }

    async fn set_vars(&self, id: &str, vars: Map<String, Value>) -> Result<()> {
        let mut record = self
            .workflows
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Workflow, id))?;
        record.vars = vars;
        Ok(())
    }

    async fn list_children(&self, id: &str) -> Result<Vec<WorkflowRecord>> {
        let mut children: Vec<WorkflowRecord> = self
            .workflows
            .iter()
            .filter(|r| r.parent.as_ref().is_some_and(|p| p.workflow_id == id))
            .map(|r| r.value().clone())
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(children)
    }

    async fn insert_task(&self, workflow_id: &str, record: TaskRecord) -> Result<()> {
        self.with_instance(workflow_id, |inst| {
            inst.tasks.insert(record.name.clone(), record);
            Ok(())
        })
    }

    async fn load_task(&self, workflow_id: &str, task: &str) -> Result<TaskRecord> {
        self.with_instance(workflow_id, |inst| {
            inst.tasks
                .get(task)
                .cloned()
                .ok_or_else(|| EngineError::not_found(EntityKind::Task, task))
        })
    }

    async fn update_task_state(&self, workflow_id: &str, task: &str, state: TaskState) -> Result<TaskRecord> {
        self.with_instance(workflow_id, |inst| {
            let record = inst
                .tasks
                .get_mut(task)
                .ok_or_else(|| EngineError::not_found(EntityKind::Task, task))?;
            if !record.state.can_transition_to(state) {
                return Err(EngineError::invalid_transition(EntityKind::Task, task, record.state, state));
            }
            record.state = state;
            if state == TaskState::Active {
                record.generation += 1;
            }
            Ok(record.clone())
        })
    }

    async fn load_tasks(&self, workflow_id: &str) -> Result<Vec<TaskRecord>> {
        self.with_instance(workflow_id, |inst| Ok(inst.tasks.values().cloned().collect()))
    }

    async fn insert_condition(&self, workflow_id: &str, record: ConditionRecord) -> Result<()> {
        self.with_instance(workflow_id, |inst| {
            inst.conditions.insert(record.name, record.marking);
            Ok(())
        })
    }

    async fn marking(&self, workflow_id: &str, condition: &str) -> Result<u32> {
        self.with_instance(workflow_id, |inst| {
            inst.conditions
                .get(condition)
                .copied()
                .ok_or_else(|| EngineError::not_found(EntityKind::Condition, condition))
        })
    }

    async fn increment_marking(&self, workflow_id: &str, condition: &str) -> Result<u32> {
        self.with_instance(workflow_id, |inst| {
            let marking = inst
                .conditions
                .get_mut(condition)
                .ok_or_else(|| EngineError::not_found(EntityKind::Condition, condition))?;
            *marking += 1;
            Ok(*marking)
        })
    }

    async fn decrement_marking(&self, workflow_id: &str, condition: &str) -> Result<u32> {
        self.with_instance(workflow_id, |inst| {
            let marking = inst
                .conditions
                .get_mut(condition)
                .ok_or_else(|| EngineError::not_found(EntityKind::Condition, condition))?;
            *marking = marking.saturating_sub(1);
            Ok(*marking)
        })
    }

    async fn zero_marking(&self, workflow_id: &str, condition: &str) -> Result<()> {
        self.with_instance(workflow_id, |inst| {
            let marking = inst
                .conditions
                .get_mut(condition)
                .ok_or_else(|| EngineError::not_found(EntityKind::Condition, condition))?;
            *marking = 0;
            Ok(())
        })
    }

    async fn load_conditions(&self, workflow_id: &str) -> Result<Vec<ConditionRecord>> {
        self.with_instance(workflow_id, |inst| {
            Ok(inst
                .conditions
                .iter()
                .map(|(name, marking)| ConditionRecord {
                    name: name.clone(),
                    marking: *marking,
                })
                .collect())
        })
    }

    async fn create_work_item(&self, workflow_id: &str, record: WorkItemRecord) -> Result<()> {
        self.with_instance(workflow_id, |inst| {
            inst.work_items.insert(record.id.clone(), record);
            Ok(())
        })
    }

    async fn load_work_item(&self, workflow_id: &str, id: &str) -> Result<WorkItemRecord> {
        self.with_instance(workflow_id, |inst| {
            inst.work_items
                .get(id)
                .cloned()
                .ok_or_else(|| EngineError::not_found(EntityKind::WorkItem, id))
        })
    }

    async fn update_work_item_state(&self, workflow_id: &str, id: &str, state: WorkItemState) -> Result<WorkItemRecord> {
        self.with_instance(workflow_id, |inst| {
            let record = inst
                .work_items
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found(EntityKind::WorkItem, id))?;
            if !record.state.can_transition_to(state) {
                return Err(EngineError::invalid_transition(EntityKind::WorkItem, id, record.state, state));
            }
            record.state = state;
            Ok(record.clone())
        })
    }

    async fn set_work_item_payload(&self, workflow_id: &str, id: &str, payload: Value) -> Result<()> {
        self.with_instance(workflow_id, |inst| {
            let record = inst
                .work_items
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found(EntityKind::WorkItem, id))?;
            record.payload = payload;
            Ok(())
        })
    }

    async fn load_work_items(&self, workflow_id: &str) -> Result<Vec<WorkItemRecord>> {
        self.with_instance(workflow_id, |inst| Ok(inst.work_items.values().cloned().collect()))
    }
}
