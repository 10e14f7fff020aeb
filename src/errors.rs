use crate::container::ContainerRuntimeError;
use crate::repository::RepositoryError;
use thiserror::Error;
use uuid::Uuid;

/// EngineError: every error surfaced to callers of the core maps to one of
/// these kinds. The `message` is safe to show to end users; `raw_error_message`
/// may carry runtime/driver output and is meant for operators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Job not found: {job_id}")]
    NotFound { job_id: Uuid },

    #[error("Conflicting job state: {message}")]
    ConflictState { message: String },

    #[error("Container runtime unavailable: {message}")]
    RuntimeUnavailable {
        message: String,
        raw_error_message: Option<String>,
    },

    #[error("Resource unavailable: {message}")]
    ResourceUnavailable { message: String },

    #[error("Internal error: {message}")]
    InternalError {
        message: String,
        raw_error_message: Option<String>,
    },
}

impl EngineError {
    pub fn new_invalid_input<T: Into<String>>(message: T) -> Self {
        EngineError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn new_not_found(job_id: Uuid) -> Self {
        EngineError::NotFound { job_id }
    }

    pub fn new_conflict_state<T: Into<String>>(message: T) -> Self {
        EngineError::ConflictState {
            message: message.into(),
        }
    }

    pub fn new_internal<T: Into<String>>(message: T, raw_error_message: Option<String>) -> Self {
        EngineError::InternalError {
            message: message.into(),
            raw_error_message,
        }
    }

    /// Returns the message which is safe to display to the end user.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

impl From<ContainerRuntimeError> for EngineError {
    fn from(err: ContainerRuntimeError) -> Self {
        match err {
            ContainerRuntimeError::Unavailable { raw_error_message } => EngineError::RuntimeUnavailable {
                message: "cannot reach the container runtime".to_string(),
                raw_error_message: Some(raw_error_message),
            },
            ContainerRuntimeError::ContainerNotFound { container_id } => EngineError::InternalError {
                message: format!("container `{container_id}` is gone"),
                raw_error_message: None,
            },
            ContainerRuntimeError::ImagePull { image, raw_error_message } => EngineError::InternalError {
                message: format!("cannot pull image `{image}`"),
                raw_error_message: Some(raw_error_message),
            },
            ContainerRuntimeError::Api { raw_error_message } => EngineError::InternalError {
                message: "container runtime api error".to_string(),
                raw_error_message: Some(raw_error_message),
            },
        }
    }
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { id } => EngineError::NotFound { job_id: id },
            RepositoryError::Storage { raw_error_message } => EngineError::InternalError {
                message: "storage error".to_string(),
                raw_error_message: Some(raw_error_message),
            },
        }
    }
}
