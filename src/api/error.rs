use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use deadpool_redis::{redis::RedisError, CreatePoolError, PoolError};
use std::borrow::Cow;

/// HTTP-facing error. Every variant carries the message shown to the caller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Bad Request: {0}")]
    BadRequest(Cow<'static, str>),
    #[error("Unauthorized: {0}")]
    Unauthorized(Cow<'static, str>),
    #[error("Not a participant: {0}")]
    NotAParticipant(Cow<'static, str>),
    #[error("Forbidden: {0}")]
    Forbidden(Cow<'static, str>),
    #[error("Not Found: {0}")]
    NotFound(Cow<'static, str>),
    #[error("Too Many Requests, retry after {retry_after}s")]
    TooManyRequests { retry_after: u64 },
    #[error("Service Unavailable: {0}")]
    ServiceUnavailable(Cow<'static, str>),
    #[error("Internal Server Error")]
    InternalServer,
}

#[derive(serde::Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: Cow<'static, str>,
}

impl Error {
    pub fn bad_request(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "ValidationError",
            Error::Unauthorized(_) => "AuthenticationFailed",
            Error::NotAParticipant(_) => "NotAParticipant",
            Error::Forbidden(_) => "Forbidden",
            Error::NotFound(_) => "NotFound",
            Error::TooManyRequests { .. } => "RateLimited",
            Error::ServiceUnavailable(_) => "BackendUnavailable",
            Error::InternalServer => "Internal",
        }
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match *self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::NotAParticipant(_) | Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::InternalServer => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut res = HttpResponse::build(self.status_code());

        match self {
            Error::TooManyRequests { retry_after } => {
                res.insert_header(("Retry-After", retry_after.to_string()));
                res.json(ErrorBody { code: self.code(), message: "Too many requests".into() })
            }
            Error::ServiceUnavailable(_) => {
                res.insert_header(("Retry-After", "1"));
                res.json(ErrorBody {
                    code: self.code(),
                    message: "Service temporarily unavailable, please retry".into(),
                })
            }
            Error::NotFound(msg)
            | Error::Unauthorized(msg)
            | Error::BadRequest(msg)
            | Error::NotAParticipant(msg)
            | Error::Forbidden(msg) => {
                res.json(ErrorBody { code: self.code(), message: msg.clone() })
            }
            Error::InternalServer => {
                res.json(ErrorBody { code: self.code(), message: "Internal Server Error".into() })
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SystemError {
    // jwt errors
    #[error("JWT Error")]
    JwtError(#[from] jsonwebtoken::errors::Error),
    // sqlx errors
    #[error("Database Error : {0}")]
    DatabaseError(Cow<'static, str>),
    #[error("Migration Error")]
    MigrateError(#[from] sqlx::migrate::MigrateError),
    // serde errors
    #[error("JSON Serialization/Deserialization Error")]
    JsonError(#[from] serde_json::Error),
    // redis errors
    #[error(transparent)]
    PoolInit(#[from] CreatePoolError),
    #[error("Redis pool error: {0}")]
    PoolGet(#[from] PoolError),
    #[error("Redis error")]
    RedisError(#[from] RedisError),
    // Domain taxonomy
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(Cow<'static, str>),
    #[error("Not a participant: {0}")]
    NotAParticipant(Cow<'static, str>),
    #[error("Forbidden: {0}")]
    Forbidden(Cow<'static, str>),
    #[error("Rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("Not Found: {0}")]
    NotFound(Cow<'static, str>),
    #[error("Validation Error: {0}")]
    ValidationError(Cow<'static, str>),
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(Cow<'static, str>),
    #[error("Internal System Error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl From<SystemError> for Error {
    fn from(value: SystemError) -> Self {
        match value {
            SystemError::ValidationError(msg) => Error::BadRequest(msg),
            SystemError::AuthenticationFailed(msg) => Error::Unauthorized(msg),
            SystemError::JwtError(_) => Error::Unauthorized("Token Invalid or Expired".into()),
            SystemError::NotAParticipant(msg) => Error::NotAParticipant(msg),
            SystemError::Forbidden(msg) => Error::Forbidden(msg),
            SystemError::NotFound(msg) => Error::NotFound(msg),
            SystemError::RateLimited { retry_after } => Error::TooManyRequests { retry_after },
            SystemError::BackendUnavailable(msg) => Error::ServiceUnavailable(msg),
            SystemError::PoolGet(_) | SystemError::RedisError(_) => {
                log::error!("Backend Error: {:?}", value);
                Error::ServiceUnavailable("cache backend".into())
            }
            _ => {
                log::error!("Internal Server Error: {:?}", value);
                Error::InternalServer
            }
        }
    }
}

impl From<sqlx::Error> for SystemError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // unique_violation
                Some("23505") => {
                    let field = db_err
                        .constraint()
                        .and_then(|c| c.split('_').next_back())
                        .unwrap_or("value")
                        .to_string();
                    SystemError::ValidationError(format!("{field} already exists").into())
                }
                // foreign_key_violation
                Some("23503") => SystemError::NotFound("Referenced resource not found".into()),
                _ => {
                    log::error!("Unhandled DB error: {:?}", db_err);
                    SystemError::DatabaseError(db_err.message().to_string().into())
                }
            },
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => {
                log::warn!("Database unavailable: {:?}", err);
                SystemError::BackendUnavailable("database".into())
            }
            _ => {
                log::error!("{:?}", err);
                SystemError::InternalError(Box::new(err))
            }
        }
    }
}

impl SystemError {
    pub fn validation(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn not_found(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unauthenticated(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    pub fn forbidden(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_a_participant() -> Self {
        Self::NotAParticipant("You are not a participant of this conversation".into())
    }

    pub fn backend_unavailable(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Stable code used on the wire for websocket `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            SystemError::AuthenticationFailed(_) | SystemError::JwtError(_) => {
                "AuthenticationFailed"
            }
            SystemError::NotAParticipant(_) => "NotAParticipant",
            SystemError::Forbidden(_) => "Forbidden",
            SystemError::RateLimited { .. } => "RateLimited",
            SystemError::NotFound(_) => "NotFound",
            SystemError::ValidationError(_) | SystemError::JsonError(_) => "ValidationError",
            SystemError::BackendUnavailable(_)
            | SystemError::PoolGet(_)
            | SystemError::RedisError(_) => "BackendUnavailable",
            _ => "Internal",
        }
    }

    /// Message safe to show to the originator of a failed event.
    pub fn client_message(&self) -> String {
        match self {
            SystemError::AuthenticationFailed(m)
            | SystemError::NotAParticipant(m)
            | SystemError::Forbidden(m)
            | SystemError::NotFound(m)
            | SystemError::ValidationError(m) => m.to_string(),
            SystemError::JwtError(_) => "Token Invalid or Expired".to_string(),
            SystemError::JsonError(_) => "Malformed payload".to_string(),
            SystemError::RateLimited { retry_after } => {
                format!("Too many requests, retry after {retry_after}s")
            }
            SystemError::BackendUnavailable(_)
            | SystemError::PoolGet(_)
            | SystemError::RedisError(_) => "Service temporarily unavailable, please retry".into(),
            _ => "Internal Server Error".to_string(),
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            SystemError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.code(), "BackendUnavailable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_maps_to_http_status() {
        let cases: Vec<(SystemError, StatusCode)> = vec![
            (SystemError::unauthenticated("bad token"), StatusCode::UNAUTHORIZED),
            (SystemError::not_a_participant(), StatusCode::FORBIDDEN),
            (SystemError::forbidden("not yours"), StatusCode::FORBIDDEN),
            (SystemError::RateLimited { retry_after: 3 }, StatusCode::TOO_MANY_REQUESTS),
            (SystemError::not_found("gone"), StatusCode::NOT_FOUND),
            (SystemError::validation("empty"), StatusCode::BAD_REQUEST),
            (SystemError::backend_unavailable("db"), StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (system, status) in cases {
            let err: Error = system.into();
            assert_eq!(err.status_code(), status);
        }
    }

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let err: Error = SystemError::RateLimited { retry_after: 7 }.into();
        let res = err.error_response();
        assert_eq!(res.headers().get("Retry-After").and_then(|v| v.to_str().ok()), Some("7"));
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(SystemError::not_a_participant().code(), "NotAParticipant");
        assert_eq!(SystemError::RateLimited { retry_after: 1 }.code(), "RateLimited");
        assert_eq!(SystemError::RateLimited { retry_after: 1 }.retry_after(), Some(1));
        assert!(SystemError::backend_unavailable("db").is_retryable());
        assert!(!SystemError::validation("x").is_retryable());
    }

    #[test]
    fn test_internal_errors_are_hidden() {
        let err = SystemError::DatabaseError("relation \"x\" does not exist".into());
        assert_eq!(err.client_message(), "Internal Server Error");
        let http: Error = err.into();
        assert!(matches!(http, Error::InternalServer));
    }
}
