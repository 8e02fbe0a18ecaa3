use crate::dsl::JoinType;
use crate::error::Result;
use crate::runtime::context::Context;
use crate::runtime::net::TaskDef;
use crate::runtime::or_join::{MarkingSnapshot, OrJoinAnalyzer};

/// Resolves a task's join condition against the instance's current markings.
pub struct JoinEvaluator;

impl JoinEvaluator {
    pub async fn is_satisfied(ctx: &Context, task: &TaskDef) -> Result<bool> {
        match task.join_type {
            JoinType::And => {
                for condition in &task.preset {
                    if ctx.store.marking(&ctx.workflow_id, condition).await? == 0 {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            JoinType::Xor => {
                let mut marked = 0;
                for condition in &task.preset {
                    if ctx.store.marking(&ctx.workflow_id, condition).await? > 0 {
                        marked += 1;
                    }
                }
                Ok(marked == 1)
            }
            JoinType::Or => {
                let snapshot = MarkingSnapshot::capture(ctx).await?;
                OrJoinAnalyzer::new(&ctx.net, ctx.or_join_search_limit()).is_enabled(&task.name, &snapshot)
            }
        }
    }
}
