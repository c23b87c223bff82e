use thiserror::Error;

#[derive(Debug, Error)]
pub enum MenderError {
    // Flow definition errors
    #[error("Node not found: {0}")]
    UnknownNode(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Invalid edge {from} -> {to}: {reason}")]
    InvalidEdge {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Flow contains a cycle through node: {0}")]
    Cycle(String),

    #[error("Flow must contain exactly one trigger node (found {0})")]
    MissingTrigger(usize),

    // Node state machine errors
    #[error("Status {status} is not valid for {kind} node {node}")]
    InvalidStatus {
        node: String,
        kind: String,
        status: String,
    },

    #[error("Invalid transition for node {node}: {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: String,
        to: String,
    },

    #[error("Join {join} has no input port for source {source_id}")]
    UnknownPort { join: String, source_id: String },

    // Execution errors
    #[error("Node execution failed: {node}: {message}")]
    Execution { node: String, message: String },

    #[error("Runner stopped")]
    RunnerStopped,

    // Monitor errors
    #[error("Failure not found: {0}")]
    FailureNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MenderError>;
