#![forbid(unsafe_code)]

// Error taxonomy surfaced to signaling clients

use crate::media::MediaError;
use serde::Serialize;
use thiserror::Error;

/// Classified failure of a signaling request.
///
/// Every error raised inside a room turn is converted into one of these
/// before it reaches the wire. `Internal` never exposes its detail to the
/// client; it is logged instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("media engine error: {0}")]
    MediaEngine(String),

    #[error("request timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type SignalingResult<T> = Result<T, SignalingError>;

/// Wire form of the error kind, sent as `errorCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "ValidationError")]
    Validation,
    PermissionDenied,
    NotFound,
    Conflict,
    #[serde(rename = "MediaEngineError")]
    MediaEngine,
    Timeout,
    Internal,
}

impl SignalingError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SignalingError::Validation(_) => ErrorCode::Validation,
            SignalingError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            SignalingError::NotFound(_) => ErrorCode::NotFound,
            SignalingError::Conflict(_) => ErrorCode::Conflict,
            SignalingError::MediaEngine(_) => ErrorCode::MediaEngine,
            SignalingError::Timeout => ErrorCode::Timeout,
            SignalingError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Message safe to hand to the client.
    pub fn client_message(&self) -> String {
        match self {
            SignalingError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn not_joined() -> Self {
        SignalingError::NotFound("peer is not joined to a room".to_string())
    }

    pub fn room_closed() -> Self {
        SignalingError::NotFound("room closed".to_string())
    }
}

impl From<MediaError> for SignalingError {
    fn from(err: MediaError) -> Self {
        SignalingError::MediaEngine(err.to_string())
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::Validation(format!("malformed request: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_serialize_to_kind_names() {
        let code = serde_json::to_value(SignalingError::Validation("x".into()).code()).unwrap();
        assert_eq!(code, "ValidationError");
        let code = serde_json::to_value(SignalingError::MediaEngine("x".into()).code()).unwrap();
        assert_eq!(code, "MediaEngineError");
        let code = serde_json::to_value(SignalingError::Timeout.code()).unwrap();
        assert_eq!(code, "Timeout");
    }

    #[test]
    fn test_internal_message_is_opaque() {
        let err = SignalingError::Internal("worker 3 lost its router map".into());
        assert_eq!(err.client_message(), "internal error");
        assert_eq!(SignalingError::Conflict("taken".into()).client_message(), "taken");
    }

    #[test]
    fn test_media_error_maps_to_media_engine() {
        let err: SignalingError = MediaError::Transport("dtls failed".into()).into();
        assert_eq!(err.code(), ErrorCode::MediaEngine);
    }
}
