use async_trait::async_trait;
use serde_json::Value;
use crate::runtime::context::Context;
use crate::runtime::syscall::Syscall;
use anyhow::Result;
use std::fmt::Debug;

pub mod builtin;

/// What an activity sees of the task firing it is attached to.
pub struct ActivityContext<'a> {
    pub ctx: &'a Context,
    pub task: &'a str,
    pub generation: u32,
    /// `params` of the task definition.
    pub params: &'a Value,
    /// Work item created for this firing, if the task is atomic.
    pub work_item_id: Option<&'a str>,
}

/// 插件接口：任务上挂载的业务活动
/// Errors fail the enclosing workflow instance.
#[async_trait]
pub trait TaskActivity: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Runs right after the task became active.
    async fn on_fire(&self, _activity: &ActivityContext<'_>, _syscall: &mut dyn Syscall) -> Result<()> {
        Ok(())
    }

    /// Runs before the split is evaluated, so variable changes steer routing.
    async fn on_complete(&self, _activity: &ActivityContext<'_>, _syscall: &mut dyn Syscall) -> Result<()> {
        Ok(())
    }
}
