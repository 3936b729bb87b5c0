use serde::Serialize;
use crate::{cluster::ClusterError, store::StoreError, validate::ValidationError};

/// Wire shape of every realtime error: `{"status":"error","message":"..."}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorFrame { pub status: &'static str, pub message: String }

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self { Self { status: "error", message: message.into() } }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("connection closed: {0}")]
    Connection(String),
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn permission(msg: impl Into<String>) -> Self { Self::Permission(msg.into()) }
    pub fn not_found(msg: impl Into<String>) -> Self { Self::NotFound(msg.into()) }
    pub fn upstream(msg: impl Into<String>) -> Self { Self::Upstream(msg.into()) }

    /// Short stable code, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Permission(_) => "permission",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Upstream(_) => "upstream",
            Self::Connection(_) => "connection",
            Self::Config(_) => "config",
        }
    }

    /// Message safe to show on a client connection.
    pub fn client_message(&self) -> String {
        match self {
            Self::Permission(m) | Self::NotFound(m) => m.clone(),
            Self::Validation(v) => v.to_string(),
            _ => "Internal server error".into(),
        }
    }
}

impl From<ClusterError> for Error {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::NotFound(m) => Self::NotFound(m),
            ClusterError::Conflict(m) => Self::Conflict(m),
            ClusterError::Transport(m) => Self::Connection(m),
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => Self::NotFound(m),
            StoreError::Backend(m) => Self::Upstream(m),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_frame_shape() {
        let v = serde_json::to_value(ErrorFrame::new("App has been deleted")).unwrap();
        assert_eq!(v, serde_json::json!({"status":"error","message":"App has been deleted"}));
    }

    #[test]
    fn cluster_errors_map_to_taxonomy() {
        assert!(matches!(Error::from(ClusterError::NotFound("x".into())), Error::NotFound(_)));
        assert!(matches!(Error::from(ClusterError::Conflict("x".into())), Error::Conflict(_)));
        assert!(matches!(Error::from(ClusterError::Upstream { code: 500, message: "boom".into() }), Error::Upstream(_)));
        assert_eq!(Error::upstream("x").client_message(), "Internal server error");
    }
}
