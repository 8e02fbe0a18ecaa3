use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{EngineError, EntityKind, Result};
use crate::runtime::storage::{
    ConditionRecord, StateStore, TaskRecord, TaskState, WorkItemRecord, WorkItemState,
    WorkflowRecord, WorkflowState,
};

// Floor-at-zero decrement; returns -1 when the field is missing.
const DECREMENT_SCRIPT: &str = r#"
    local current = redis.call("HGET", KEYS[1], ARGV[1])
    if current == false then
        return -1
    end
    local val = tonumber(current) - 1
    if val < 0 then
        val = 0
    end
    redis.call("HSET", KEYS[1], ARGV[1], val)
    return val
"#;

/// Redis 存储：每个实例一组 key
///
/// `{prefix}:wf:{id}` holds the workflow record as JSON; `:tasks`, `:conditions` and
/// `:items` are hashes keyed by name or id; `:children` is a set of nested instance ids.
/// Callers serialize mutations per root instance, so read-check-write sequences are not
/// wrapped in transactions.
pub struct RedisStateStore {
    client: redis::Client,
    prefix: String,
}

impl RedisStateStore {
    pub fn new(client: redis::Client) -> Self {
        Self::with_prefix(client, "petrel")
    }

    pub fn with_prefix(client: redis::Client, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
        }
    }

    fn workflow_key(&self, id: &str) -> String {
        format!("{}:wf:{}", self.prefix, id)
    }

    fn tasks_key(&self, id: &str) -> String {
        format!("{}:wf:{}:tasks", self.prefix, id)
    }

    fn conditions_key(&self, id: &str) -> String {
        format!("{}:wf:{}:conditions", self.prefix, id)
    }

    fn items_key(&self, id: &str) -> String {
        format!("{}:wf:{}:items", self.prefix, id)
    }

    fn children_key(&self, id: &str) -> String {
        format!("{}:wf:{}:children", self.prefix, id)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set(self.workflow_key(&record.id), serde_json::to_string(record)?)
            .await?;
        Ok(())
    }

    async fn save_task(&self, workflow_id: &str, record: &TaskRecord) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(self.tasks_key(workflow_id), &record.name, serde_json::to_string(record)?)
            .await?;
        Ok(())
    }

    async fn save_work_item(&self, workflow_id: &str, record: &WorkItemRecord) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(self.items_key(workflow_id), &record.id, serde_json::to_string(record)?)
            .await?;
        Ok(())
    }

    async fn ensure_condition(&self, workflow_id: &str, condition: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.hexists(self.conditions_key(workflow_id), condition).await?;
        if !exists {
            return Err(EngineError::not_found(EntityKind::Condition, condition));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn create_workflow(&self, record: WorkflowRecord) -> Result<()> {
        if let Some(parent) = &record.parent {
            let mut conn = self.conn().await?;
            let _: () = conn
                .sadd(self.children_key(&parent.workflow_id), &record.id)
                .await?;
        }
        self.save_workflow(&record).await
    }

    async fn load_workflow(&self, id: &str) -> Result<WorkflowRecord> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.workflow_key(id)).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(EngineError::not_found(EntityKind::Workflow, id)),
        }
    }

    async fn update_workflow_state(&self, id: &str, state: WorkflowState) -> Result<()> {
        let mut record = self.load_workflow(id).await?;
        if !record.state.can_transition_to(state) {
            return Err(EngineError::invalid_transition(EntityKind::Workflow, id, record.state, state));
        }
        record.state = state;
        self.save_workflow(&record).await
    }

    async fn get_vars(&self, id: &str) -> Result<Map<String, Value>> {
        Ok(self.load_workflow(id).await?.vars)
    }

    async fn set_vars(&self, id: &str, vars: Map<String, Value>) -> Result<()> {
        let mut record = self.load_workflow(id).await?;
        record.vars = vars;
        self.save_workflow(&record).await
    }

    async fn list_children(&self, id: &str) -> Result<Vec<WorkflowRecord>> {
        let mut conn = self.conn().await?;
        let mut ids: Vec<String> = conn.smembers(self.children_key(id)).await?;
        ids.sort();
        let mut children = Vec::with_capacity(ids.len());
        for child in ids {
            children.push(self.load_workflow(&child).await?);
        }
        Ok(children)
    }

    async fn insert_task(&self, workflow_id: &str, record: TaskRecord) -> Result<()> {
        self.save_task(workflow_id, &record).await
    }

    async fn load_task(&self, workflow_id: &str, task: &str) -> Result<TaskRecord> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.hget(self.tasks_key(workflow_id), task).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(EngineError::not_found(EntityKind::Task, task)),
        }
    }

    async fn update_task_state(&self, workflow_id: &str, task: &str, state: TaskState) -> Result<TaskRecord> {
        let mut record = self.load_task(workflow_id, task).await?;
        if !record.state.can_transition_to(state) {
            return Err(EngineError::invalid_transition(EntityKind::Task, task, record.state, state));
        }
        record.state = state;
        if state == TaskState::Active {
            record.generation += 1;
        }
        self.save_task(workflow_id, &record).await?;
        Ok(record)
    }

    async fn load_tasks(&self, workflow_id: &str) -> Result<Vec<TaskRecord>> {
        let mut conn = self.conn().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.tasks_key(workflow_id)).await?;
        let mut tasks = raw
            .values()
            .map(|json| serde_json::from_str::<TaskRecord>(json))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tasks)
    }

    async fn insert_condition(&self, workflow_id: &str, record: ConditionRecord) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(self.conditions_key(workflow_id), &record.name, record.marking)
            .await?;
        Ok(())
    }

    async fn marking(&self, workflow_id: &str, condition: &str) -> Result<u32> {
        let mut conn = self.conn().await?;
        let marking: Option<u32> = conn.hget(self.conditions_key(workflow_id), condition).await?;
        marking.ok_or_else(|| EngineError::not_found(EntityKind::Condition, condition))
    }

    async fn increment_marking(&self, workflow_id: &str, condition: &str) -> Result<u32> {
        self.ensure_condition(workflow_id, condition).await?;
        let mut conn = self.conn().await?;
        let marking: u32 = conn.hincr(self.conditions_key(workflow_id), condition, 1).await?;
        Ok(marking)
    }

    async fn decrement_marking(&self, workflow_id: &str, condition: &str) -> Result<u32> {
        let mut conn = self.conn().await?;
        let marking: i64 = redis::Script::new(DECREMENT_SCRIPT)
            .key(self.conditions_key(workflow_id))
            .arg(condition)
            .invoke_async(&mut conn)
            .await?;
        u32::try_from(marking).map_err(|_| EngineError::not_found(EntityKind::Condition, condition))
    }

    async fn zero_marking(&self, workflow_id: &str, condition: &str) -> Result<()> {
        self.ensure_condition(workflow_id, condition).await?;
        let mut conn = self.conn().await?;
        let _: () = conn.hset(self.conditions_key(workflow_id), condition, 0).await?;
        Ok(())
    }

    async fn load_conditions(&self, workflow_id: &str) -> Result<Vec<ConditionRecord>> {
        let mut conn = self.conn().await?;
        let raw: HashMap<String, u32> = conn.hgetall(self.conditions_key(workflow_id)).await?;
        let mut conditions: Vec<ConditionRecord> = raw
            .into_iter()
            .map(|(name, marking)| ConditionRecord { name, marking })
            .collect();
        conditions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(conditions)
    }

    async fn create_work_item(&self, workflow_id: &str, record: WorkItemRecord) -> Result<()> {
        self.save_work_item(workflow_id, &record).await
    }

    async fn load_work_item(&self, workflow_id: &str, id: &str) -> Result<WorkItemRecord> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.hget(self.items_key(workflow_id), id).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(EngineError::not_found(EntityKind::WorkItem, id)),
        }
    }

    async fn update_work_item_state(&self, workflow_id: &str, id: &str, state: WorkItemState) -> Result<WorkItemRecord> {
        let mut record = self.load_work_item(workflow_id, id).await?;
        if !record.state.can_transition_to(state) {
            return Err(EngineError::invalid_transition(EntityKind::WorkItem, id, record.state, state));
        }
        record.state = state;
        self.save_work_item(workflow_id, &record).await?;
        Ok(record)
    }

    async fn set_work_item_payload(&self, workflow_id: &str, id: &str, payload: Value) -> Result<()> {
        let mut record = self.load_work_item(workflow_id, id).await?;
        record.payload = payload;
        self.save_work_item(workflow_id, &record).await
    }

    async fn load_work_items(&self, workflow_id: &str) -> Result<Vec<WorkItemRecord>> {
        let mut conn = self.conn().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.items_key(workflow_id)).await?;
        let mut items = raw
            .values()
            .map(|json| serde_json::from_str::<WorkItemRecord>(json))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }
}
