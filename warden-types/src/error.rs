use std::fmt::Display;

use serde::Serialize;
use serde_with::{serde_as, DisplayFromStr};
use thiserror::Error;

pub use http::StatusCode;
use tracing_error::SpanTrace;

/// A shared error type used to produce a public error and add additional
/// context for internal diagnostics. The public error is produced from the
/// inner error [`Display`] implementation and the `status_code` field. The
/// internal error report is created from the [`Debug`] implementation and
/// the `span_trace` field.
#[serde_as]
#[derive(Error, Debug, Serialize)]
pub struct ApiError {
    // Only the Display format of the source error will be returned to the client.
    #[serde_as(as = "DisplayFromStr")]
    #[source]
    pub error: anyhow::Error,
    #[serde(skip)]
    pub status_code: StatusCode,
    #[serde(skip)]
    pub span_trace: Option<SpanTrace>,
}

impl Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let report = self.report();
        // Logs get the full report; the client-facing string comes out of
        // serialization instead
        write!(f, "{report:?}")
    }
}

#[derive(Debug)]
pub struct Report {
    pub cause: String,
    pub span_trace: Option<SpanTrace>,
}

impl ApiError {
    #[must_use]
    pub fn report(&self) -> Report {
        Report {
            cause: format!("{:?}", self.error.root_cause()),
            span_trace: self.span_trace.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct AliasTaken {
        alias: String,
    }

    impl std::error::Error for AliasTaken {}

    impl Display for AliasTaken {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "domain alias `{}` is already taken", self.alias)
        }
    }

    #[test]
    fn only_the_display_form_reaches_the_client() {
        let api_err = ApiError {
            error: AliasTaken {
                alias: "acme".into(),
            }
            .into(),
            status_code: StatusCode::CONFLICT,
            span_trace: None,
        };

        let serialized = serde_json::to_string(&api_err).unwrap();
        assert_eq!(
            serialized,
            r#"{"error":"domain alias `acme` is already taken"}"#
        );

        // The internal report carries the Debug form of the root cause
        let report = api_err.report();
        assert_eq!(report.cause, r#"AliasTaken { alias: "acme" }"#);
        assert!(report.span_trace.is_none());
    }
}
