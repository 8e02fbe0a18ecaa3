use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// What kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Net,
    Workflow,
    Task,
    Condition,
    WorkItem,
    Activity,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::Net => "net",
            EntityKind::Workflow => "workflow",
            EntityKind::Task => "task",
            EntityKind::Condition => "condition",
            EntityKind::WorkItem => "work item",
            EntityKind::Activity => "activity",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: EntityKind, name: String },

    #[error("invalid {kind} transition for {name}: {from} -> {to}")]
    InvalidTransition {
        kind: EntityKind,
        name: String,
        from: String,
        to: String,
    },

    /// Malformed net, or an OR-join analysis that ran past its bound.
    #[error("net consistency: {0}")]
    NetConsistency(String),

    #[error("activity for task {task} failed: {message}")]
    Activity { task: String, message: String },

    #[error("queue drain exceeded {0} steps")]
    DrainLimitExceeded(usize),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn invalid_transition(
        kind: EntityKind,
        name: impl Into<String>,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        EngineError::InvalidTransition {
            kind,
            name: name.into(),
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, EngineError::InvalidTransition { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}
