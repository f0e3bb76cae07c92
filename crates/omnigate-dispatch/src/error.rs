use omnigate_common::ErrorCategory;

/// The dispatch path's error: a machine-readable category plus the message
/// surfaced to the client and, for upstream passthrough, the original body.
#[derive(Debug, thiserror::Error)]
#[error("{category:?}: {message}")]
pub struct DispatchError {
    pub category: ErrorCategory,
    pub message: String,
    /// Upstream body to pass through verbatim on the final attempt.
    pub upstream_body: Option<bytes::Bytes>,
    pub upstream_status: Option<u16>,
}

impl DispatchError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            upstream_body: None,
            upstream_status: None,
        }
    }

    pub fn upstream(
        category: ErrorCategory,
        status: u16,
        body: bytes::Bytes,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            message: message.into(),
            upstream_body: Some(body),
            upstream_status: Some(status),
        }
    }

    pub fn http_status(&self) -> u16 {
        self.upstream_status.unwrap_or(self.category.http_status())
    }
}

impl From<sea_orm::DbErr> for DispatchError {
    fn from(err: sea_orm::DbErr) -> Self {
        DispatchError::new(ErrorCategory::Internal, format!("storage error: {err}"))
    }
}
