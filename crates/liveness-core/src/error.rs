use serde::Serialize;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced to the embedding application. Never dropped silently.
#[derive(Error, Debug)]
pub enum FaceLivenessError {
    #[error("Session not found.")]
    SessionNotFound {
        #[source]
        source: Option<BoxError>,
    },
    #[error("Not authorized to perform a face liveness check.")]
    AccessDenied {
        #[source]
        source: Option<BoxError>,
    },
    #[error("Camera permissions have not been granted.")]
    CameraPermissionDenied,
    #[error("Session timed out.")]
    SessionTimedOut {
        #[source]
        source: Option<BoxError>,
    },
    /// Timeout variant raised by the oval-fit guard.
    #[error("Face did not match oval within time limit.")]
    FaceInOvalMatchExceededTimeLimit,
    #[error("The camera failed to produce frames in time.")]
    CameraTimeout,
    #[error("User cancelled the face liveness check.")]
    UserCancelled,
    #[error("Received an unsupported challenge type from the service.")]
    UnsupportedChallengeType,
    #[error("{message}")]
    Other {
        message: String,
        recovery_suggestion: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl FaceLivenessError {
    pub fn other(message: impl Into<String>, recovery_suggestion: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            recovery_suggestion: recovery_suggestion.into(),
            source: None,
        }
    }

    /// Wrap an arbitrary failure (transport, network, codec).
    pub fn wrap(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self::Other {
            message: source.to_string(),
            recovery_suggestion: DEFAULT_RECOVERY.to_string(),
            source: Some(source),
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }

    pub fn recovery_suggestion(&self) -> &str {
        match self {
            Self::SessionNotFound { .. } => "Enter a valid session ID.",
            Self::AccessDenied { .. } => "Valid credentials are required for the face liveness check.",
            Self::CameraPermissionDenied => "Prompt the user to grant camera permission.",
            Self::SessionTimedOut { .. } | Self::FaceInOvalMatchExceededTimeLimit => {
                "Retry the face liveness check and prompt the user to follow the on screen instructions."
            }
            Self::CameraTimeout => "Check that no other application is using the camera.",
            Self::UserCancelled => DEFAULT_RECOVERY,
            Self::UnsupportedChallengeType => "Update to the latest version of the library.",
            Self::Other {
                recovery_suggestion,
                ..
            } => recovery_suggestion,
        }
    }

    /// Timeouts are retryable; the variant tells the UI which one happened.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::SessionTimedOut { .. } | Self::FaceInOvalMatchExceededTimeLimit | Self::CameraTimeout
        )
    }

    /// Permission problems need user action; retrying alone will not help.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::CameraPermissionDenied | Self::AccessDenied { .. } | Self::UnsupportedChallengeType
        )
    }

    /// Cancellation ends the session but is not shown as a failure.
    pub fn suppresses_error_ui(&self) -> bool {
        matches!(self, Self::UserCancelled)
    }

    /// Close code sent when this error tears the session down.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::UserCancelled => CloseCode::Canceled,
            Self::FaceInOvalMatchExceededTimeLimit => CloseCode::Timeout,
            _ => CloseCode::RuntimeError,
        }
    }
}

const DEFAULT_RECOVERY: &str = "Retry the face liveness check.";

/// Session close codes understood by the verification service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseCode {
    Timeout,
    Canceled,
    LostFocus,
    RuntimeError,
    Disposed,
}

impl CloseCode {
    pub fn code(&self) -> u16 {
        match self {
            Self::Timeout => 4001,
            Self::Canceled => 4003,
            Self::LostFocus => 4004,
            Self::RuntimeError => 4005,
            Self::Disposed => 4008,
        }
    }
}
