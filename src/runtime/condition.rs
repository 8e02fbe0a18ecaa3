use tracing::trace;

use crate::error::Result;
use crate::runtime::context::Context;
use crate::runtime::events::StateChange;
use crate::runtime::net::ConditionDef;
use crate::runtime::task::Task;

/// Place coordinator: reads and writes its marking through the store and cascades
/// enablement changes to the postset tasks.
pub struct Condition<'a> {
    ctx: &'a Context,
    def: &'a ConditionDef,
}

impl<'a> Condition<'a> {
    pub fn new(ctx: &'a Context, def: &'a ConditionDef) -> Self {
        Self { ctx, def }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub async fn marking(&self) -> Result<u32> {
        self.ctx.store.marking(&self.ctx.workflow_id, &self.def.name).await
    }

    /// Every postset task is re-evaluated: an XOR-join that now sees a second marked
    /// input is disabled again.
    pub async fn increment_marking(&self) -> Result<()> {
        let marking = self
            .ctx
            .store
            .increment_marking(&self.ctx.workflow_id, &self.def.name)
            .await?;
        self.emit(marking);

        for task in self.postset()? {
            best_effort(task.reevaluate().await, task.name())?;
        }
        Ok(())
    }

    /// Floors at zero. Every postset task is re-evaluated: it stays enabled only while
    /// its join still holds.
    pub async fn decrement_marking(&self) -> Result<()> {
        if self.marking().await? > 0 {
            let marking = self
                .ctx
                .store
                .decrement_marking(&self.ctx.workflow_id, &self.def.name)
                .await?;
            self.emit(marking);
        }

        for task in self.postset()? {
            best_effort(task.reevaluate().await, task.name())?;
        }
        Ok(())
    }

    pub async fn cancel(&self) -> Result<()> {
        if self.marking().await? > 0 {
            self.ctx
                .store
                .zero_marking(&self.ctx.workflow_id, &self.def.name)
                .await?;
            self.emit(0);
        }

        for task in self.postset()? {
            best_effort(task.disable().await.map(|_| ()), task.name())?;
        }
        Ok(())
    }

    fn postset(&self) -> Result<Vec<Task<'a>>> {
        let ctx: &'a Context = self.ctx;
        self.def
            .postset
            .iter()
            .map(|name| Ok(Task::new(ctx, ctx.net.task(name)?)))
            .collect()
    }

    fn emit(&self, marking: u32) {
        self.ctx.emit(StateChange::Marking {
            workflow_id: self.ctx.workflow_id.clone(),
            condition: self.def.name.clone(),
            marking,
        });
    }
}

/// Fan-out siblings may already be in the target state; anything else is real.
pub(crate) fn best_effort(result: Result<()>, name: &str) -> Result<()> {
    match result {
        Err(e) if e.is_invalid_transition() => {
            trace!(task = %name, error = %e, "transition skipped");
            Ok(())
        }
        other => other,
    }
}
