use std::fmt::Display;

use sqlx::error::DatabaseError;
use sqlx::sqlite::SqliteError;
use thiserror::Error;
use tracing_error::SpanTrace;
use warden_types::error::{ApiError, StatusCode};
use warden_types::key::Key;

#[derive(Error, Debug)]
pub enum ErrorType {
    #[error("Internal error")]
    Storage(sqlx::Error),
    #[error("Internal error")]
    InternalError(anyhow::Error),
    #[error("Internal error")]
    BadData(String),
    #[error("Failed to authenticate the credentials")]
    Authentication(anyhow::Error),
    /// Carries the decoded key so callers can clean up its stored row.
    #[error("Token has expired")]
    KeyExpired { key: Box<Key> },
    #[error("Invalid token")]
    InvalidToken,
    #[error("Caller is not authorized to perform the operation")]
    Authorization,
    #[error("Subject is not a member of the domain")]
    DomainAuthorization,
    #[error("{0}")]
    MalformedEntity(String),
    #[error("{0}")]
    NotFound(String),
    #[error("A resource with that identifier already exists")]
    UniqueConstraintViolation {
        #[source]
        error: sqlx::Error,
    },
    #[error("The resource update was not processable")]
    ForeignKeyViolation {
        #[source]
        error: sqlx::Error,
    },
    #[error("Group has members or non-empty descendants")]
    GroupNotEmpty,
    #[error("Member is already assigned to the group")]
    MemberAlreadyAssigned,
    #[error("Unable to execute migration script `{filename}`")]
    Migration {
        #[source]
        error: sqlx::Error,
        filename: String,
    },
}

#[derive(Error, Debug)]
pub struct Error {
    pub variant: ErrorType,
    pub span_trace: SpanTrace,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}", self.variant, self.span_trace)
    }
}

impl Error {
    /// Wrap an error as the cause of a failed authentication.
    #[must_use]
    pub fn into_authentication(self) -> Self {
        Self {
            variant: ErrorType::Authentication(anyhow::Error::new(self.variant)),
            span_trace: self.span_trace,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.variant, ErrorType::NotFound(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        #[allow(clippy::redundant_closure_for_method_calls)]
        if let Some(error_code) = err
            .as_database_error()
            .and_then(|db_err| db_err.try_downcast_ref::<SqliteError>())
        {
            if let Some(code) = error_code.code().map(|str| str.to_string()) {
                match &code[..] {
                    // FK constraint violation
                    "787" => {
                        return Self {
                            variant: ErrorType::ForeignKeyViolation { error: err },
                            span_trace: SpanTrace::capture(),
                        };
                    }
                    // UNIQUE constraint violation
                    "1555" | "2067" => {
                        return Self {
                            variant: ErrorType::UniqueConstraintViolation { error: err },
                            span_trace: SpanTrace::capture(),
                        };
                    }
                    _ => {}
                }
            }
        }
        Self {
            variant: ErrorType::Storage(err),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl From<ErrorType> for Error {
    fn from(err: ErrorType) -> Self {
        Self {
            variant: err,
            span_trace: SpanTrace::capture(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status_code = match err.variant {
            ErrorType::Storage(_)
            | ErrorType::InternalError(_)
            | ErrorType::BadData(_)
            | ErrorType::Migration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::Authentication(_)
            | ErrorType::KeyExpired { .. }
            | ErrorType::InvalidToken => StatusCode::UNAUTHORIZED,
            ErrorType::Authorization | ErrorType::DomainAuthorization => StatusCode::FORBIDDEN,
            ErrorType::NotFound(_) => StatusCode::NOT_FOUND,
            ErrorType::MalformedEntity(_) => StatusCode::BAD_REQUEST,
            ErrorType::UniqueConstraintViolation { .. } => StatusCode::CONFLICT,
            ErrorType::ForeignKeyViolation { .. }
            | ErrorType::GroupNotEmpty
            | ErrorType::MemberAlreadyAssigned => StatusCode::UNPROCESSABLE_ENTITY,
        };

        ApiError {
            error: err.variant.into(),
            status_code,
            span_trace: Some(err.span_trace),
        }
    }
}
