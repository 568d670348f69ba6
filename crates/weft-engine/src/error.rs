use crate::task::TaskId;

/// Errors from task engine operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The engine refused to create a task.
    #[error("task creation rejected by scheduler {0}")]
    Rejected(String),

    /// The engine refused to attach callbacks to a reserved task.
    #[error("scheduler refused callbacks for task {0}")]
    InstallRejected(TaskId),

    /// The task id was never issued by this scheduler.
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    /// The task already has private data attached.
    #[error("task {0} already has callbacks installed")]
    AlreadyInstalled(TaskId),

    /// The task has already started or completed and cannot be changed.
    #[error("task {0} has already started")]
    AlreadyStarted(TaskId),
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
