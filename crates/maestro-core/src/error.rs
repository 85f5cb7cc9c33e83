use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Top-level error type for the Maestro engines.
#[derive(Error, Debug)]
pub enum MaestroError {
    /// A workflow definition failed structural validation.
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    /// A task with the same id has already been admitted.
    #[error("Duplicate task id: {0}")]
    DuplicateTask(Uuid),

    /// No task with this id is known to the queue.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// A status change that the task lifecycle does not allow.
    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        /// Task being transitioned.
        id: Uuid,
        /// Status the task was in.
        from: String,
        /// Status that was requested.
        to: String,
    },

    /// No workflow definition is registered under this id.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No workflow execution is registered under this id.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// `start` called on an execution that has already left `Ready`.
    #[error("Execution {id} already started (status: {status})")]
    AlreadyStarted {
        /// Execution being started.
        id: Uuid,
        /// Status the execution was in.
        status: String,
    },

    /// Cancel, pause or resume requested from a state that does not allow it.
    #[error("Rejected: {0}")]
    CancellationRejected(String),

    /// An error reported by an agent connector.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A structural problem in a workflow definition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The graph contains a cycle; `path` lists the node ids along it.
    #[error("Workflow contains a cycle: {}", .path.join(" -> "))]
    Cycle {
        /// Node ids along the cycle, first node repeated at the end.
        path: Vec<String>,
    },

    /// A connection references a node that is not part of the definition.
    #[error("Connection {from} -> {to} references unknown node '{missing}'")]
    DanglingConnection {
        /// Source node id of the connection.
        from: String,
        /// Target node id of the connection.
        to: String,
        /// The endpoint that does not exist.
        missing: String,
    },

    /// A node id was added twice.
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    /// Every node has at least one incoming connection.
    #[error("No entry nodes found")]
    NoEntryNodes,

    /// More than one node is not attached to any connection.
    #[error("Multiple disconnected nodes: {}", .0.join(", "))]
    DisconnectedNodes(Vec<String>),

    /// The definition has no nodes at all.
    #[error("Workflow has no nodes")]
    EmptyWorkflow,

    /// A node's config cannot be turned into an executable step.
    #[error("Invalid config for node '{node}': {reason}")]
    InvalidNodeConfig {
        /// Offending node id.
        node: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<Vec<ValidationError>> for MaestroError {
    fn from(errors: Vec<ValidationError>) -> Self {
        MaestroError::Validation(errors)
    }
}

impl From<ValidationError> for MaestroError {
    fn from(error: ValidationError) -> Self {
        MaestroError::Validation(vec![error])
    }
}
