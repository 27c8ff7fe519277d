#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("missing dependency: {0}")]
    DependencyMissing(String),

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("instance already running: {0}")]
    AlreadyRunning(String),

    #[error("instance must be stopped: {0}")]
    NotStopped(String),

    #[error("shutdown failed: {0}")]
    Shutdown(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VmError>;
