use std::sync::Arc;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::Result;
use crate::runtime::events::StateChange;
use crate::runtime::net::NetModel;
use crate::runtime::storage::StateStore;

/// 运行时上下文 (Runtime Context)
/// 绑定一个工作流实例：网模型 + 状态存储 + 事件流
#[derive(Clone)] // Context should be cheap to clone (just Arcs)
pub struct Context {
    pub workflow_id: String,
    pub net: Arc<NetModel>,
    pub store: Arc<dyn StateStore>,
    events: broadcast::Sender<StateChange>,
    or_join_search_limit: usize,
}

impl Context {
    pub fn new(
        workflow_id: String,
        net: Arc<NetModel>,
        store: Arc<dyn StateStore>,
        events: broadcast::Sender<StateChange>,
        or_join_search_limit: usize,
    ) -> Self {
        Self {
            workflow_id,
            net,
            store,
            events,
            or_join_search_limit,
        }
    }

    /// Same store and feed, different instance.
    pub fn for_instance(&self, workflow_id: String, net: Arc<NetModel>) -> Self {
        Self {
            workflow_id,
            net,
            store: self.store.clone(),
            events: self.events.clone(),
            or_join_search_limit: self.or_join_search_limit,
        }
    }

    pub fn or_join_search_limit(&self) -> usize {
        self.or_join_search_limit
    }

    pub fn emit(&self, change: StateChange) {
        trace!(workflow_id = %self.workflow_id, ?change, "state change");
        // No subscribers is fine.
        let _ = self.events.send(change);
    }

    pub async fn get_var(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.store.get_vars(&self.workflow_id).await?.get(key).cloned())
    }

    pub async fn set_var(&self, key: &str, value: Value) -> Result<()> {
        let mut vars = self.store.get_vars(&self.workflow_id).await?;
        vars.insert(key.to_string(), value);
        self.store.set_vars(&self.workflow_id, vars).await
    }

    pub async fn get_all_vars(&self) -> Result<Map<String, Value>> {
        self.store.get_vars(&self.workflow_id).await
    }

    pub async fn set_all_vars(&self, vars: Map<String, Value>) -> Result<()> {
        self.store.set_vars(&self.workflow_id, vars).await
    }
}
