use tracing::debug;

use crate::dsl::SplitType;
use crate::error::Result;
use crate::runtime::condition::{best_effort, Condition};
use crate::runtime::context::Context;
use crate::runtime::events::StateChange;
use crate::runtime::join::JoinEvaluator;
use crate::runtime::net::{Flow, TaskDef};
use crate::runtime::storage::{TaskRecord, TaskState, WorkItemState};

/// Transition coordinator. Holds no state of its own; the store is the source of truth.
pub struct Task<'a> {
    ctx: &'a Context,
    def: &'a TaskDef,
}

impl<'a> Task<'a> {
    pub fn new(ctx: &'a Context, def: &'a TaskDef) -> Self {
        Self { ctx, def }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &'a TaskDef {
        self.def
    }

    pub async fn record(&self) -> Result<TaskRecord> {
        self.ctx.store.load_task(&self.ctx.workflow_id, &self.def.name).await
    }

    pub async fn state(&self) -> Result<TaskState> {
        Ok(self.record().await?.state)
    }

    async fn transition(&self, to: TaskState) -> Result<TaskRecord> {
        let record = self
            .ctx
            .store
            .update_task_state(&self.ctx.workflow_id, &self.def.name, to)
            .await?;
        self.ctx.emit(StateChange::TaskState {
            workflow_id: self.ctx.workflow_id.clone(),
            task: self.def.name.clone(),
            state: record.state,
            generation: record.generation,
        });
        Ok(record)
    }

    /// No-op unless the state machine allows `Enabled` and the join holds.
    pub async fn enable(&self) -> Result<bool> {
        if !self.state().await?.can_transition_to(TaskState::Enabled) {
            return Ok(false);
        }
        if !JoinEvaluator::is_satisfied(self.ctx, self.def).await? {
            return Ok(false);
        }
        self.transition(TaskState::Enabled).await?;
        Ok(true)
    }

    pub async fn disable(&self) -> Result<bool> {
        if !self.state().await?.can_transition_to(TaskState::Disabled) {
            return Ok(false);
        }
        self.transition(TaskState::Disabled).await?;
        Ok(true)
    }

    /// Brings the enabled/disabled flag in line with the join.
    pub async fn reevaluate(&self) -> Result<()> {
        match self.state().await? {
            TaskState::Enabled => {
                if !JoinEvaluator::is_satisfied(self.ctx, self.def).await? {
                    self.disable().await?;
                }
            }
            TaskState::Disabled | TaskState::Completed | TaskState::Cancelled => {
                self.enable().await?;
            }
            TaskState::Active | TaskState::Failed => {}
        }
        Ok(())
    }

    /// Fires the task: consumes one token from each input. Returns the new generation.
    pub async fn activate(&self) -> Result<u32> {
        let record = self.transition(TaskState::Active).await?;
        for name in &self.def.preset {
            Condition::new(self.ctx, self.ctx.net.condition(name)?)
                .decrement_marking()
                .await?;
        }
        Ok(record.generation)
    }

    /// Cancels the region, then produces tokens per the split type.
    /// Returns the region tasks that were active and got cancelled.
    pub async fn complete(&self) -> Result<Vec<String>> {
        self.transition(TaskState::Completed).await?;
        self.close_work_items().await?;
        let cancelled = self.cancel_region().await?;
        self.produce().await?;
        // Inputs may still hold tokens from an earlier round.
        best_effort(self.enable().await.map(|_| ()), &self.def.name)?;
        Ok(cancelled)
    }

    /// Flips `Active` to `Cancelled`. Neighbours are left alone.
    pub async fn cancel(&self) -> Result<()> {
        self.transition(TaskState::Cancelled).await?;
        self.close_work_items().await
    }

    pub async fn fail(&self) -> Result<()> {
        self.transition(TaskState::Failed).await?;
        self.close_work_items().await
    }

    /// Region/instance cancellation: active tasks are cancelled, enabled ones withdrawn.
    /// Returns true when the task was active.
    pub async fn withdraw(&self) -> Result<bool> {
        match self.state().await? {
            TaskState::Active => {
                self.cancel().await?;
                Ok(true)
            }
            TaskState::Enabled => {
                self.disable().await?;
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_region(&self) -> Result<Vec<String>> {
        let region = &self.def.cancellation_region;
        let mut cancelled = Vec::new();
        for name in &region.tasks {
            let task = Task::new(self.ctx, self.ctx.net.task(name)?);
            match task.withdraw().await {
                Ok(true) => cancelled.push(name.clone()),
                Ok(false) => {}
                Err(e) => best_effort(Err(e), name)?,
            }
        }
        for name in &region.conditions {
            Condition::new(self.ctx, self.ctx.net.condition(name)?)
                .cancel()
                .await?;
        }
        if !region.is_empty() {
            debug!(workflow_id = %self.ctx.workflow_id, task = %self.def.name, ?cancelled, "cancellation region applied");
        }
        Ok(cancelled)
    }

    /// Split resolution.
    async fn produce(&self) -> Result<()> {
        let vars = self.ctx.get_all_vars().await?;
        let targets: Vec<&Flow> = match self.def.split_type {
            SplitType::And => self.def.flows.iter().collect(),
            SplitType::Or => self
                .def
                .flows
                .iter()
                .filter(|f| f.is_default || f.admits(&vars))
                .collect(),
            SplitType::Xor => self
                .def
                .xor_order()
                .into_iter()
                .find(|f| f.is_default || f.admits(&vars))
                .into_iter()
                .collect(),
        };
        if targets.is_empty() {
            debug!(workflow_id = %self.ctx.workflow_id, task = %self.def.name, "split produced no token");
        }
        for flow in targets {
            Condition::new(self.ctx, self.ctx.net.condition(&flow.condition)?)
                .increment_marking()
                .await?;
        }
        Ok(())
    }

    /// Outstanding work items of this task are cancelled once the task leaves `Active`.
    async fn close_work_items(&self) -> Result<()> {
        let items = self
            .ctx
            .store
            .work_items_for_task(&self.ctx.workflow_id, &self.def.name)
            .await?;
        for item in items.into_iter().filter(|i| !i.state.is_final()) {
            let record = self
                .ctx
                .store
                .update_work_item_state(&self.ctx.workflow_id, &item.id, WorkItemState::Canceled)
                .await?;
            self.ctx.emit(StateChange::WorkItemState {
                workflow_id: self.ctx.workflow_id.clone(),
                work_item_id: record.id,
                task: record.task_name,
                state: record.state,
            });
        }
        Ok(())
    }
}
