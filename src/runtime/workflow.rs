use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{EngineError, EntityKind, Result};
use crate::runtime::condition::{best_effort, Condition};
use crate::runtime::context::Context;
use crate::runtime::events::StateChange;
use crate::runtime::net::NetModel;
use crate::runtime::storage::{
    ConditionRecord, ParentRef, TaskRecord, TaskState, WorkflowRecord, WorkflowSnapshot,
    WorkflowState,
};
use crate::runtime::task::Task;

/// 工作流实例聚合：网模型绑定到一个具体实例 id
pub struct Workflow {
    ctx: Context,
}

impl Workflow {
    /// Binds to an instance that already exists in the store.
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Creates the instance records: running, every task disabled, every marking 0.
    pub async fn initialize(ctx: Context, parent: Option<ParentRef>, vars: Map<String, Value>) -> Result<Self> {
        let store = &ctx.store;
        store
            .create_workflow(WorkflowRecord {
                id: ctx.workflow_id.clone(),
                name: ctx.net.id.clone(),
                state: WorkflowState::Running,
                parent,
                vars,
            })
            .await?;
        for name in ctx.net.tasks.keys() {
            store
                .insert_task(&ctx.workflow_id, TaskRecord {
                    name: name.clone(),
                    state: TaskState::Disabled,
                    generation: 0,
                })
                .await?;
        }
        for name in ctx.net.conditions.keys() {
            store
                .insert_condition(&ctx.workflow_id, ConditionRecord {
                    name: name.clone(),
                    marking: 0,
                })
                .await?;
        }
        ctx.emit(StateChange::WorkflowState {
            workflow_id: ctx.workflow_id.clone(),
            state: WorkflowState::Running,
        });
        Ok(Self { ctx })
    }

    /// Restores the instance (and its nested instances) from a snapshot. `nets` maps
    /// every instance id in the tree to the net it runs.
    pub async fn resume(
        ctx: Context,
        snapshot: &WorkflowSnapshot,
        nets: &HashMap<String, Arc<NetModel>>,
    ) -> Result<Self> {
        if snapshot.workflow.id != ctx.workflow_id || snapshot.workflow.name != ctx.net.id {
            return Err(EngineError::NetConsistency(format!(
                "snapshot of {} ({}) does not match instance {} ({})",
                snapshot.workflow.id, snapshot.workflow.name, ctx.workflow_id, ctx.net.id
            )));
        }
        let mut pending = vec![snapshot];
        while let Some(snap) = pending.pop() {
            let net = nets
                .get(&snap.workflow.id)
                .ok_or_else(|| EngineError::not_found(EntityKind::Net, snap.workflow.name.clone()))?;
            check_snapshot(snap, net)?;
            pending.extend(snap.children.iter());
        }
        ctx.store.restore(snapshot).await?;
        Ok(Self { ctx })
    }

    pub fn id(&self) -> &str {
        &self.ctx.workflow_id
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub async fn record(&self) -> Result<WorkflowRecord> {
        self.ctx.store.load_workflow(&self.ctx.workflow_id).await
    }

    pub async fn state(&self) -> Result<WorkflowState> {
        Ok(self.record().await?.state)
    }

    pub fn task(&self, name: &str) -> Result<Task<'_>> {
        Ok(Task::new(&self.ctx, self.ctx.net.task(name)?))
    }

    pub fn condition(&self, name: &str) -> Result<Condition<'_>> {
        Ok(Condition::new(&self.ctx, self.ctx.net.condition(name)?))
    }

    /// Puts the initial token on the start condition.
    pub async fn start(&self) -> Result<()> {
        self.ensure_running(WorkflowState::Running).await?;
        self.condition(&self.ctx.net.start_condition)?
            .increment_marking()
            .await
    }

    pub async fn is_end_reached(&self) -> Result<bool> {
        Ok(self.condition(&self.ctx.net.end_condition)?.marking().await? > 0)
    }

    /// Cancels every task and condition. Returns the tasks that were active.
    pub async fn cancel(&self) -> Result<Vec<String>> {
        self.ensure_running(WorkflowState::Canceled).await?;
        let active = self.withdraw_tasks().await?;
        for name in self.ctx.net.conditions.keys() {
            self.condition(name)?.cancel().await?;
        }
        self.set_state(WorkflowState::Canceled).await?;
        Ok(active)
    }

    /// Same teardown as `cancel`, ending in `Failed`.
    pub async fn fail(&self) -> Result<Vec<String>> {
        self.ensure_running(WorkflowState::Failed).await?;
        let active = self.withdraw_tasks().await?;
        for name in self.ctx.net.conditions.keys() {
            self.condition(name)?.cancel().await?;
        }
        self.set_state(WorkflowState::Failed).await?;
        Ok(active)
    }

    /// End reached: leftover tasks are withdrawn, markings stay as they are.
    pub async fn complete(&self) -> Result<Vec<String>> {
        self.ensure_running(WorkflowState::Completed).await?;
        let active = self.withdraw_tasks().await?;
        if !active.is_empty() {
            warn!(workflow_id = %self.id(), ?active, "end reached while tasks were still active");
        }
        self.set_state(WorkflowState::Completed).await?;
        Ok(active)
    }

    /// Rejects calls on a final instance before anything is written.
    async fn ensure_running(&self, to: WorkflowState) -> Result<()> {
        let state = self.state().await?;
        if state != WorkflowState::Running {
            return Err(EngineError::invalid_transition(EntityKind::Workflow, self.id(), state, to));
        }
        Ok(())
    }

    async fn withdraw_tasks(&self) -> Result<Vec<String>> {
        let mut active = Vec::new();
        for name in self.ctx.net.tasks.keys() {
            match self.task(name)?.withdraw().await {
                Ok(true) => active.push(name.clone()),
                Ok(false) => {}
                Err(e) => best_effort(Err(e), name)?,
            }
        }
        Ok(active)
    }

    async fn set_state(&self, state: WorkflowState) -> Result<()> {
        self.ctx
            .store
            .update_workflow_state(&self.ctx.workflow_id, state)
            .await?;
        self.ctx.emit(StateChange::WorkflowState {
            workflow_id: self.ctx.workflow_id.clone(),
            state,
        });
        debug!(workflow_id = %self.id(), ?state, "workflow state changed");
        Ok(())
    }

    /// Retries OR-joins that are not enabled but hold at least one input token; their
    /// pending branches may have died without touching the join's own inputs.
    pub async fn reevaluate_or_joins(&self) -> Result<()> {
        let tasks = self.ctx.store.load_tasks(&self.ctx.workflow_id).await?;
        for def in self.ctx.net.or_join_tasks() {
            let Some(record) = tasks.iter().find(|t| t.name == def.name) else {
                continue;
            };
            if !record.state.can_transition_to(TaskState::Enabled) {
                continue;
            }
            let mut any_marked = false;
            for c in &def.preset {
                if self.ctx.store.marking(&self.ctx.workflow_id, c).await? > 0 {
                    any_marked = true;
                    break;
                }
            }
            if any_marked {
                Task::new(&self.ctx, def).enable().await?;
            }
        }
        Ok(())
    }

    pub async fn enabled_tasks(&self) -> Result<Vec<String>> {
        Ok(self
            .ctx
            .store
            .load_tasks(&self.ctx.workflow_id)
            .await?
            .into_iter()
            .filter(|t| t.state == TaskState::Enabled)
            .map(|t| t.name)
            .collect())
    }
}

/// Every task and condition of the net must be present in the snapshot.
fn check_snapshot(snapshot: &WorkflowSnapshot, net: &NetModel) -> Result<()> {
    if snapshot.workflow.name != net.id {
        return Err(EngineError::NetConsistency(format!(
            "snapshot of {} runs {}, expected {}",
            snapshot.workflow.id, snapshot.workflow.name, net.id
        )));
    }
    for name in net.tasks.keys() {
        if !snapshot.tasks.iter().any(|t| &t.name == name) {
            return Err(EngineError::not_found(EntityKind::Task, name.clone()));
        }
    }
    for name in net.conditions.keys() {
        if !snapshot.conditions.iter().any(|c| &c.name == name) {
            return Err(EngineError::not_found(EntityKind::Condition, name.clone()));
        }
    }
    Ok(())
}
