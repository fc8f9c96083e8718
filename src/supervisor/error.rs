//! Errors surfaced by the lifecycle controller. Each variant maps to an HTTP
//! status and a machine readable code so the IPC layer can answer directly.

use axum::http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid module name '{0}'. Use letters, numbers, hyphens and underscores")]
    InvalidName(String),

    #[error("A module named '{0}' already exists")]
    NameConflict(String),

    #[error("Module '{0}' not found")]
    NotFound(String),

    #[error("Module '{0}' is not a dev-server capable app")]
    NotDevCapable(String),

    #[error("No module archive was uploaded")]
    MissingUpload,

    #[error("Invalid module archive: {0}")]
    InvalidArchive(String),

    #[error("Failed to start dev server for '{module}': {reason}")]
    SpawnError { module: String, reason: String },

    #[error("Timed out after {secs}s waiting for dev server of '{module}'")]
    StartTimeout { module: String, secs: u64 },

    #[error("No free dev server port left (limit {0})")]
    PortsExhausted(u16),

    #[error("Failed to delete module '{module}': {source}")]
    DeleteFailed {
        module: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidName(_)
            | Self::NotDevCapable(_)
            | Self::MissingUpload
            | Self::InvalidArchive(_) => StatusCode::BAD_REQUEST,
            Self::NameConflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PortsExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SpawnError { .. }
            | Self::StartTimeout { .. }
            | Self::DeleteFailed { .. }
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "INVALID_NAME",
            Self::NameConflict(_) => "NAME_CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NotDevCapable(_) => "NOT_DEV_CAPABLE",
            Self::MissingUpload => "MISSING_UPLOAD",
            Self::InvalidArchive(_) => "INVALID_ARCHIVE",
            Self::SpawnError { .. } => "SPAWN_ERROR",
            Self::StartTimeout { .. } => "START_TIMEOUT",
            Self::PortsExhausted(_) => "PORTS_EXHAUSTED",
            Self::DeleteFailed { .. } => "DELETE_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "status": "error",
            "error": self.to_string(),
            "code": self.error_code(),
        })
    }
}

impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        if self.status_code().is_server_error() {
            tracing::error!("{}", self);
        }
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(SupervisorError::InvalidName("con".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(SupervisorError::NameConflict("a".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(SupervisorError::NotFound("a".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            SupervisorError::StartTimeout { module: "a".into(), secs: 30 }.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_json_carries_code() {
        let err = SupervisorError::DeleteFailed {
            module: "demo".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "busy"),
        };
        let json = err.to_json();
        assert_eq!(json["code"], "DELETE_FAILED");
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("demo"));
    }
}
