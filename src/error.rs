//! Central error type for the request pipeline and its collaborators.
//!
//! Every failure surfaced while dispatching a request collapses into one of
//! these kinds so the pipeline's outer recovery boundary can map it to a
//! status code and an access-log `response_type` in exactly one place
//! (spec section 7: predicates never write two responses).

use hyper::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NavigatorError {
    #[error("tenant {0:?} is not configured")]
    TenantNotFound(String),

    #[error("failed to start application: {0}")]
    TenantStartFailed(String),

    #[error("upstream connection failed: {0}")]
    UpstreamUnavailable(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("request blocked by bot policy")]
    BotBlocked,

    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl NavigatorError {
    /// HTTP status this error maps to (spec section 7, error -> surface table).
    pub fn status_code(&self) -> StatusCode {
        match self {
            NavigatorError::TenantNotFound(_) => StatusCode::NOT_FOUND,
            NavigatorError::TenantStartFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            NavigatorError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            NavigatorError::AuthRequired => StatusCode::UNAUTHORIZED,
            NavigatorError::BotBlocked => StatusCode::FORBIDDEN,
            NavigatorError::InvalidTarget(_) => StatusCode::BAD_GATEWAY,
            NavigatorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `response_type` metadata field for the access logger.
    pub fn response_type(&self) -> &'static str {
        match self {
            NavigatorError::TenantNotFound(_) => "error",
            NavigatorError::TenantStartFailed(_) => "error",
            NavigatorError::UpstreamUnavailable(_) => "error",
            NavigatorError::AuthRequired => "auth-failure",
            NavigatorError::BotBlocked => "error",
            NavigatorError::InvalidTarget(_) => "error",
            NavigatorError::Internal(_) => "error",
        }
    }

    /// Body text returned to the client. Deliberately short (spec section 7:
    /// "no body beyond short text" for upstream failures).
    pub fn body_text(&self) -> String {
        match self {
            NavigatorError::TenantStartFailed(_) => "Failed to start application".to_string(),
            NavigatorError::UpstreamUnavailable(_) => "Bad Gateway".to_string(),
            NavigatorError::TenantNotFound(_) => "Not Found".to_string(),
            NavigatorError::AuthRequired => "Authentication required".to_string(),
            NavigatorError::BotBlocked => "Forbidden".to_string(),
            NavigatorError::InvalidTarget(_) => "Bad Gateway".to_string(),
            NavigatorError::Internal(_) => "Internal Server Error".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NavigatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(
            NavigatorError::TenantNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            NavigatorError::TenantStartFailed("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            NavigatorError::UpstreamUnavailable("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(NavigatorError::AuthRequired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(NavigatorError::BotBlocked.status_code(), StatusCode::FORBIDDEN);
    }
}
