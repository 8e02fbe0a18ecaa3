use serde_json::Value;

use crate::runtime::storage::WorkflowState;

/// 引擎工作队列中的一项请求
/// Every external call and every callback-initiated transition becomes one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    StartWorkflow { workflow_id: String },
    CancelWorkflow { workflow_id: String },
    FireTask { workflow_id: String, task: String },
    CompleteTask { workflow_id: String, task: String },
    CancelTask { workflow_id: String, task: String },
    FailTask { workflow_id: String, task: String, reason: String },
    StartWorkItem { workflow_id: String, work_item_id: String },
    CompleteWorkItem { workflow_id: String, work_item_id: String, payload: Option<Value> },
    CancelWorkItem { workflow_id: String, work_item_id: String },
    FailWorkItem { workflow_id: String, work_item_id: String, reason: String },
    /// A nested instance reached a final state; applied to its composite task leniently.
    ChildFinished { workflow_id: String, task: String, child_id: String, outcome: WorkflowState },
}

impl Request {
    pub fn workflow_id(&self) -> &str {
        match self {
            Request::StartWorkflow { workflow_id }
            | Request::CancelWorkflow { workflow_id }
            | Request::FireTask { workflow_id, .. }
            | Request::CompleteTask { workflow_id, .. }
            | Request::CancelTask { workflow_id, .. }
            | Request::FailTask { workflow_id, .. }
            | Request::StartWorkItem { workflow_id, .. }
            | Request::CompleteWorkItem { workflow_id, .. }
            | Request::CancelWorkItem { workflow_id, .. }
            | Request::FailWorkItem { workflow_id, .. }
            | Request::ChildFinished { workflow_id, .. } => workflow_id,
        }
    }
}

/// 系统调用接口
/// Activities use this to request further transitions. Requests are queued and run
/// after the current one, never inline.
pub trait Syscall: Send + Sync {
    fn request(&mut self, request: Request);

    /// Workflow the calling activity belongs to.
    fn workflow_id(&self) -> &str;

    fn fire(&mut self, task: &str) {
        let workflow_id = self.workflow_id().to_string();
        self.request(Request::FireTask { workflow_id, task: task.to_string() });
    }

    fn complete(&mut self, task: &str) {
        let workflow_id = self.workflow_id().to_string();
        self.request(Request::CompleteTask { workflow_id, task: task.to_string() });
    }

    fn cancel(&mut self, task: &str) {
        let workflow_id = self.workflow_id().to_string();
        self.request(Request::CancelTask { workflow_id, task: task.to_string() });
    }

    fn fail(&mut self, task: &str, reason: &str) {
        let workflow_id = self.workflow_id().to_string();
        self.request(Request::FailTask {
            workflow_id,
            task: task.to_string(),
            reason: reason.to_string(),
        });
    }
}
