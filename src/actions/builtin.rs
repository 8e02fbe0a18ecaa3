use async_trait::async_trait;
use crate::actions::{ActivityContext, TaskActivity};
use crate::runtime::net::{eval_context, from_eval_value};
use crate::runtime::syscall::Syscall;
use anyhow::{anyhow, Result};
use evalexpr::eval_with_context;
use tracing::info;

#[derive(Debug)]
pub struct LogActivity;

#[async_trait]
impl TaskActivity for LogActivity {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_fire(&self, activity: &ActivityContext<'_>, _syscall: &mut dyn Syscall) -> Result<()> {
        if let Some(msg) = activity.params.get("msg").and_then(|v| v.as_str()) {
            info!(workflow_id = %activity.ctx.workflow_id, task = %activity.task, "[LOG] {}", msg);
        } else {
            info!(workflow_id = %activity.ctx.workflow_id, task = %activity.task, "[LOG] fired");
        }
        Ok(())
    }
}

/// Writes workflow variables when the task fires.
///
/// `assignments: [{key, value}]` sets literal values; `expression: "x = a + 1"`
/// evaluates the right-hand side over the current variables.
#[derive(Debug)]
pub struct AssignActivity;

#[async_trait]
impl TaskActivity for AssignActivity {
    fn name(&self) -> &str {
        "assign"
    }

    async fn on_fire(&self, activity: &ActivityContext<'_>, _syscall: &mut dyn Syscall) -> Result<()> {
        let params = activity.params;
        let mut vars = activity.ctx.get_all_vars().await?;

        // 1. Handle "assignments" list
        if let Some(list) = params.get("assignments").and_then(|v| v.as_array()) {
            for item in list {
                if let (Some(k), Some(v)) = (item.get("key").and_then(|s| s.as_str()), item.get("value")) {
                    vars.insert(k.to_string(), v.clone());
                }
            }
        }

        // 2. Handle "expression"
        if let Some(expr) = params.get("expression").and_then(|v| v.as_str()) {
            let (target_var, rhs) = expr
                .split_once('=')
                .map(|(left, right)| (left.trim(), right.trim()))
                .ok_or_else(|| anyhow!("expression must look like `var = expr`: {}", expr))?;

            let eval_ctx = eval_context(&vars);
            let result = eval_with_context(rhs, &eval_ctx)
                .map_err(|e| anyhow!("expression evaluation failed: {} -> {}", rhs, e))?;
            let value = from_eval_value(result)
                .ok_or_else(|| anyhow!("expression {} produced an unsupported value", rhs))?;
            vars.insert(target_var.to_string(), value);
        }

        activity.ctx.set_all_vars(vars).await?;
        Ok(())
    }
}

/// Completes its own task as soon as it fires (automated tasks).
#[derive(Debug)]
pub struct AutoCompleteActivity;

#[async_trait]
impl TaskActivity for AutoCompleteActivity {
    fn name(&self) -> &str {
        "auto_complete"
    }

    async fn on_fire(&self, activity: &ActivityContext<'_>, syscall: &mut dyn Syscall) -> Result<()> {
        syscall.complete(activity.task);
        Ok(())
    }
}

/// Always fails; used to exercise failure propagation.
#[derive(Debug)]
pub struct FailActivity;

#[async_trait]
impl TaskActivity for FailActivity {
    fn name(&self) -> &str {
        "fail"
    }

    async fn on_fire(&self, activity: &ActivityContext<'_>, _syscall: &mut dyn Syscall) -> Result<()> {
        let reason = activity
            .params
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("activity failed");
        Err(anyhow!("{}", reason))
    }
}

pub(crate) fn default_activities() -> Vec<std::sync::Arc<dyn TaskActivity>> {
    vec![
        std::sync::Arc::new(LogActivity),
        std::sync::Arc::new(AssignActivity),
        std::sync::Arc::new(AutoCompleteActivity),
        std::sync::Arc::new(FailActivity),
    ]
}
