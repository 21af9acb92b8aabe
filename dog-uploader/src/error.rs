use thiserror::Error;

use crate::{BlobState, Checksum, Step};

/// Result type for caller-facing uploader operations
pub type UploaderResult<T> = Result<T, UploaderError>;

/// Errors returned by manual collection and driver operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UploaderError {
    #[error("Blob not found: {checksum}")]
    NotFound { checksum: Checksum },

    #[error("Blob {checksum} cannot be primary while {state}")]
    NotPrimaryEligible { checksum: Checksum, state: BlobState },

    #[error("Blob {checksum} cannot be linked while {state}")]
    NotLinkable { checksum: Checksum, state: BlobState },

    #[error("Collection is locked while a process is running")]
    Locked,

    #[error(transparent)]
    Step(#[from] StepFailure),

    #[error("Preview fetch failed for {checksum}: {message}")]
    PreviewFailed { checksum: Checksum, message: String },

    #[error("Invalid configuration for {key}: {message}")]
    Config { key: String, message: String },
}

impl UploaderError {
    /// Create a not found error
    pub fn not_found(checksum: &Checksum) -> Self {
        Self::NotFound {
            checksum: checksum.clone(),
        }
    }

    /// Create a configuration error
    pub fn config<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Recoverable failure of one mutating pipeline step.
///
/// Each variant carries the gateway's message. The record parks at the
/// step's stable predecessor with the message as its `error_message`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepFailure {
    #[error("Upload slot request failed: {0}")]
    SlotRequestFailed(String),

    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    #[error("Blob registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Attachment link failed: {0}")]
    LinkFailed(String),

    #[error("Attachment unlink failed: {0}")]
    UnlinkFailed(String),
}

impl StepFailure {
    /// Build the failure matching a pipeline step.
    ///
    /// An empty message is replaced with the step's generic message.
    pub fn for_step(step: Step, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            step.generic_failure().to_string()
        } else {
            message
        };

        match step {
            Step::RequestSlot => Self::SlotRequestFailed(message),
            Step::Transfer => Self::TransferFailed(message),
            Step::Register => Self::RegistrationFailed(message),
            Step::Link => Self::LinkFailed(message),
            Step::Unlink => Self::UnlinkFailed(message),
        }
    }

    /// Get the gateway message
    pub fn message(&self) -> &str {
        match self {
            Self::SlotRequestFailed(msg)
            | Self::TransferFailed(msg)
            | Self::RegistrationFailed(msg)
            | Self::LinkFailed(msg)
            | Self::UnlinkFailed(msg) => msg,
        }
    }

    /// Get the step that failed
    pub fn step(&self) -> Step {
        match self {
            Self::SlotRequestFailed(_) => Step::RequestSlot,
            Self::TransferFailed(_) => Step::Transfer,
            Self::RegistrationFailed(_) => Step::Register,
            Self::LinkFailed(_) => Step::Link,
            Self::UnlinkFailed(_) => Step::Unlink,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_messages_fall_back_to_generic_text() {
        let failure = StepFailure::for_step(Step::Unlink, "  ");
        assert_eq!(failure, StepFailure::UnlinkFailed("Failed to unlink blob".to_string()));
    }

    #[test]
    fn failure_keeps_gateway_message() {
        let failure = StepFailure::for_step(Step::Transfer, "403 from bucket");
        assert_eq!(failure.message(), "403 from bucket");
        assert_eq!(failure.step(), Step::Transfer);
        assert_eq!(failure.to_string(), "File transfer failed: 403 from bucket");
    }

    #[test]
    fn step_failure_converts_into_uploader_error() {
        let err: UploaderError = StepFailure::LinkFailed("owner gone".to_string()).into();
        assert_eq!(err.to_string(), "Attachment link failed: owner gone");
    }
}
