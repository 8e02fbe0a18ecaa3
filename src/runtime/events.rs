use serde::{Deserialize, Serialize};

use crate::runtime::storage::{TaskState, WorkItemState, WorkflowState};

/// One event per committed mutation, in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateChange {
    WorkflowState {
        workflow_id: String,
        state: WorkflowState,
    },
    TaskState {
        workflow_id: String,
        task: String,
        state: TaskState,
        generation: u32,
    },
    Marking {
        workflow_id: String,
        condition: String,
        marking: u32,
    },
    WorkItemState {
        workflow_id: String,
        work_item_id: String,
        task: String,
        state: WorkItemState,
    },
}

impl StateChange {
    pub fn workflow_id(&self) -> &str {
        match self {
            StateChange::WorkflowState { workflow_id, .. }
            | StateChange::TaskState { workflow_id, .. }
            | StateChange::Marking { workflow_id, .. }
            | StateChange::WorkItemState { workflow_id, .. } => workflow_id,
        }
    }
}
