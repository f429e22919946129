use thiserror::Error;

/// Every failure the reconciliation core can surface.
///
/// A resource that does not exist is not an error: describe calls return
/// `Ok(None)` for it.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("missing prerequisite(s): {}. Set them in the environment or pass them as flags.", .names.join(", "))]
    MissingPrerequisite { names: Vec<String> },

    #[error("template '{template}' references '%{name}%' but no such variable is defined")]
    MissingVariable { template: String, name: String },

    #[error("template '{template}' is malformed: {reason}")]
    MalformedTemplate { template: String, reason: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{resource} was modified by someone else since it was read (stale etag). Re-run to pick up the current state.")]
    ConcurrentModification { resource: String },

    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    #[error("{resource} is in DELETED state. Undelete it before running again.")]
    Deleted { resource: String },

    #[error("{resource} matches more than one resource: {}", .matches.join(", "))]
    Ambiguous { resource: String, matches: Vec<String> },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("API request failed with HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0} is not supported")]
    Unsupported(String),
}

impl SetupError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        SetupError::Api { status, message: message.into() }
    }

    /// Process exit code used by the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            SetupError::MissingPrerequisite { .. } => 2,
            _ => 1,
        }
    }
}

impl From<reqwest::Error> for SetupError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            SetupError::Timeout(error.to_string())
        } else {
            SetupError::Transport(error.to_string())
        }
    }
}

impl From<serde_json::Error> for SetupError {
    fn from(error: serde_json::Error) -> Self {
        SetupError::Transport(format!("invalid JSON payload: {}", error))
    }
}

impl From<serde_yaml::Error> for SetupError {
    fn from(error: serde_yaml::Error) -> Self {
        SetupError::Config(error.to_string())
    }
}

impl From<std::io::Error> for SetupError {
    fn from(error: std::io::Error) -> Self {
        SetupError::Config(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SetupError>;
