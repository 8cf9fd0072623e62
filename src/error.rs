use std::path::PathBuf;

use serde::Serialize;

/// Errors surfaced by the capture session API.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Authorization grant is missing, refused or no longer valid")]
    AuthorizationInvalid,

    #[error("Display mirror unavailable: {0}")]
    MirrorUnavailable(String),

    #[error("A capture session is already open")]
    AlreadyOpen,

    #[error("Feature was not enabled when the session was opened")]
    NotEnabled,

    #[error("Frame capture sink is not bound")]
    NotBound,

    #[error("No frame available")]
    NoFrameAvailable,

    #[error("Not recording")]
    NotRecording,

    #[error("Recording setup failed: {0}")]
    RecordingSetupFailed(String),

    #[error("Failed to finalize recording '{path:?}': {reason}")]
    RecordingFinalizeFailed { path: PathBuf, reason: String },

    #[error("Config Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

// Hosts forward errors to their UI layer as plain strings.
impl Serialize for CaptureError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

/// Errors reported by platform implementations across the `interface::platform` seam.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("authorization revoked or stale")]
    Revoked,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("{context}: {message}")]
    Failed {
        context: &'static str,
        message: String,
    },
}

impl PlatformError {
    pub fn failed(context: &'static str, message: impl Into<String>) -> Self {
        PlatformError::Failed {
            context,
            message: message.into(),
        }
    }
}

impl From<PlatformError> for CaptureError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Revoked => CaptureError::AuthorizationInvalid,
            other => CaptureError::MirrorUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoked_maps_to_authorization_invalid() {
        let err: CaptureError = PlatformError::Revoked.into();
        assert!(matches!(err, CaptureError::AuthorizationInvalid));
    }

    #[test]
    fn test_error_serializes_as_message() {
        let json = serde_json::to_string(&CaptureError::NotRecording).unwrap();
        assert_eq!(json, "\"Not recording\"");
    }

    #[test]
    fn test_error_with_payload_serializes_inside_host_payload() {
        let errors = vec![
            CaptureError::from(PlatformError::Unavailable("no display".into())),
            CaptureError::RecordingSetupFailed("prepare encoder: busy".into()),
        ];
        let json = serde_json::to_value(&errors).unwrap();
        assert_eq!(json[0], "Display mirror unavailable: unavailable: no display");
        assert_eq!(json[1], "Recording setup failed: prepare encoder: busy");
    }
}
