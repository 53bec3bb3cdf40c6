use crate::db::executor::{ExecutionError, Row};
use crate::db::schema_manager::SchemaError;
use crate::llm::prompt::PromptError;
use crate::llm::translate::TranslationError;
use crate::sql::validator::{ReasonCode, Rejection};
use serde::Serialize;
use std::fmt;

/// Stable failure codes exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidQuestion,
    SchemaUnavailable,
    TranslationTimeout,
    TranslationServiceError,
    NoQueryExtracted,
    MultiStatementRejected,
    NonReadOperation,
    UnknownSchemaReference,
    UnboundedResultSet,
    UnparseableQuery,
    ExecutionTimeout,
    ExecutionError,
    ResultTooLarge,
    PoolExhausted,
}

impl ErrorKind {
    /// True for failures caused by the generated SQL itself
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ErrorKind::MultiStatementRejected
                | ErrorKind::NonReadOperation
                | ErrorKind::UnknownSchemaReference
                | ErrorKind::UnboundedResultSet
                | ErrorKind::UnparseableQuery
        )
    }
}

// Displays the same code callers see on the wire
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::String(code)) => f.write_str(&code),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl From<ReasonCode> for ErrorKind {
    fn from(reason: ReasonCode) -> Self {
        match reason {
            ReasonCode::MultiStatementRejected => ErrorKind::MultiStatementRejected,
            ReasonCode::NonReadOperation => ErrorKind::NonReadOperation,
            ReasonCode::UnknownSchemaReference => ErrorKind::UnknownSchemaReference,
            ReasonCode::UnboundedResultSet => ErrorKind::UnboundedResultSet,
            ReasonCode::UnparseableQuery => ErrorKind::UnparseableQuery,
        }
    }
}

/// Serializes as `{ "code": ..., "message": ... }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiFailure {
    #[serde(rename = "code")]
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<SchemaError> for ApiFailure {
    fn from(e: SchemaError) -> Self {
        ApiFailure::new(ErrorKind::SchemaUnavailable, e.to_string())
    }
}

impl From<PromptError> for ApiFailure {
    fn from(e: PromptError) -> Self {
        ApiFailure::new(ErrorKind::InvalidQuestion, e.to_string())
    }
}

impl From<TranslationError> for ApiFailure {
    fn from(e: TranslationError) -> Self {
        let kind = match &e {
            TranslationError::Timeout(_) => ErrorKind::TranslationTimeout,
            TranslationError::Service(_) => ErrorKind::TranslationServiceError,
            TranslationError::NoQueryExtracted { .. } => ErrorKind::NoQueryExtracted,
        };
        ApiFailure::new(kind, e.to_string())
    }
}

impl From<Rejection> for ApiFailure {
    fn from(rejection: Rejection) -> Self {
        ApiFailure::new(rejection.reason.into(), rejection.detail)
    }
}

impl From<ExecutionError> for ApiFailure {
    fn from(e: ExecutionError) -> Self {
        let kind = match &e {
            ExecutionError::Timeout(_) => ErrorKind::ExecutionTimeout,
            ExecutionError::Database(_) => ErrorKind::ExecutionError,
            ExecutionError::ResultTooLarge { .. } => ErrorKind::ResultTooLarge,
            ExecutionError::PoolExhausted(_) => ErrorKind::PoolExhausted,
        };
        ApiFailure::new(kind, e.to_string())
    }
}

/// Milliseconds spent in each stage of one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    pub schema: u64,
    pub prompt: u64,
    pub translation: u64,
    pub validation: u64,
    pub execution: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<u64>,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub natural_language_query: String,
    pub sql_query: String,
    pub result: Vec<Row>,
    pub row_count: usize,
    pub column_names: Vec<String>,
    pub processing_time_ms: u64,
    pub stage_timings: StageTimings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Everything a request can end in: the full payload or one failure.
#[derive(Debug, Clone)]
pub enum ApiOutcome {
    Success(QueryResponse),
    Failure(ApiFailure),
}

impl ApiOutcome {
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match self {
            ApiOutcome::Success(_) => None,
            ApiOutcome::Failure(failure) => Some(failure.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use std::time::Duration;

    #[test]
    fn test_display_matches_serialized_code() {
        let cases = [
            (ErrorKind::InvalidQuestion, "INVALID_QUESTION"),
            (ErrorKind::TranslationServiceError, "TRANSLATION_SERVICE_ERROR"),
            (ErrorKind::UnknownSchemaReference, "UNKNOWN_SCHEMA_REFERENCE"),
            (ErrorKind::ExecutionTimeout, "EXECUTION_TIMEOUT"),
            (ErrorKind::PoolExhausted, "POOL_EXHAUSTED"),
        ];
        for (kind, code) in cases {
            assert_eq!(serde_json::to_value(kind).unwrap(), serde_json::Value::from(code));
            assert_eq!(kind.to_string(), code);
        }
    }

    #[test]
    fn test_component_errors_map_to_kinds() {
        let cases: Vec<(ApiFailure, ErrorKind)> = vec![
            (
                SchemaError::Unavailable("down".into()).into(),
                ErrorKind::SchemaUnavailable,
            ),
            (PromptError::EmptyQuestion.into(), ErrorKind::InvalidQuestion),
            (
                TranslationError::Timeout(Duration::from_secs(30)).into(),
                ErrorKind::TranslationTimeout,
            ),
            (
                TranslationError::Service(LlmError::ResponseError("500".into())).into(),
                ErrorKind::TranslationServiceError,
            ),
            (
                TranslationError::NoQueryExtracted {
                    raw_response: "hm".into(),
                }
                .into(),
                ErrorKind::NoQueryExtracted,
            ),
            (
                ExecutionError::Timeout(Duration::from_secs(10)).into(),
                ErrorKind::ExecutionTimeout,
            ),
            (
                ExecutionError::ResultTooLarge { limit: 5 }.into(),
                ErrorKind::ResultTooLarge,
            ),
            (
                ExecutionError::PoolExhausted("busy".into()).into(),
                ErrorKind::PoolExhausted,
            ),
        ];

        for (failure, kind) in cases {
            assert_eq!(failure.kind, kind, "{}", failure);
        }
    }

    #[test]
    fn test_failure_serializes_code_and_message() {
        let failure = ApiFailure::new(ErrorKind::NonReadOperation, "DELETE is not allowed");
        assert_eq!(
            serde_json::to_value(&failure).unwrap(),
            serde_json::json!({"code": "NON_READ_OPERATION", "message": "DELETE is not allowed"})
        );
        assert!(failure.kind.is_rejection());
        assert!(!ErrorKind::PoolExhausted.is_rejection());
    }

    #[test]
    fn test_absent_explanation_is_omitted() {
        let response = QueryResponse {
            natural_language_query: "q".into(),
            sql_query: "SELECT 1 LIMIT 1000".into(),
            result: vec![],
            row_count: 0,
            column_names: vec![],
            processing_time_ms: 1,
            stage_timings: StageTimings::default(),
            explanation: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("explanation").is_none());
        assert!(json["stage_timings"].get("explanation").is_none());
        assert_eq!(json["sql_query"], "SELECT 1 LIMIT 1000");
    }
}
