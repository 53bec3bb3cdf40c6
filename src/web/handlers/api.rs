use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::db::schema::SchemaSnapshot;
use crate::pipeline::outcome::{ApiFailure, ApiOutcome, ErrorKind};
use crate::web::state::AppState;

/// Shortest question worth sending to the model
pub const MIN_QUESTION_CHARS: usize = 5;

// Query types

#[derive(Debug, Deserialize, Clone)]
pub struct NlQueryRequest {
    pub query: String,
    #[serde(default)]
    pub explain_results: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ApiFailure,
}

// System status

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub model: String,
    pub row_limit: u64,
    /// None until the schema cache has been loaded once
    pub table_count: Option<usize>,
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        kind if kind.is_rejection() => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::InvalidQuestion => StatusCode::BAD_REQUEST,
        ErrorKind::TranslationServiceError => StatusCode::BAD_GATEWAY,
        ErrorKind::SchemaUnavailable | ErrorKind::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::TranslationTimeout | ErrorKind::ExecutionTimeout => {
            StatusCode::GATEWAY_TIMEOUT
        }
        ErrorKind::ExecutionError => StatusCode::INTERNAL_SERVER_ERROR,
        // Nothing extracted, or too many rows
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn failure_response(failure: ApiFailure) -> Response {
    (status_for(failure.kind), Json(ErrorResponse { error: failure })).into_response()
}

pub fn check_question(question: &str) -> Result<&str, ApiFailure> {
    let question = question.trim();
    if question.chars().count() < MIN_QUESTION_CHARS {
        return Err(ApiFailure::new(
            ErrorKind::InvalidQuestion,
            format!(
                "Question must be at least {} characters long",
                MIN_QUESTION_CHARS
            ),
        ));
    }
    Ok(question)
}

// API Implementations

pub async fn sql_query(
    state: State<Arc<AppState>>,
    Json(payload): Json<NlQueryRequest>,
) -> Response {
    let question = match check_question(&payload.query) {
        Ok(question) => question,
        Err(failure) => return failure_response(failure),
    };

    info!("Natural language query: {}", question);

    match state.pipeline.run(question, payload.explain_results).await {
        ApiOutcome::Success(response) => (StatusCode::OK, Json(response)).into_response(),
        ApiOutcome::Failure(failure) => failure_response(failure),
    }
}

pub async fn get_schema(state: State<Arc<AppState>>) -> Result<Json<SchemaSnapshot>, Response> {
    let snapshot = state.introspector.get_schema().await.map_err(|e| {
        error!("Failed to load schema: {}", e);
        failure_response(e.into())
    })?;

    Ok(Json(snapshot.as_ref().clone()))
}

pub async fn system_status(state: State<Arc<AppState>>) -> Json<SystemStatus> {
    let now = chrono::Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        model: state.model_id.clone(),
        row_limit: state.config.pipeline.row_limit,
        table_count: state.introspector.cached().map(|s| s.table_count()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_questions_are_invalid() {
        let failure = check_question("  hi  ").unwrap_err();
        assert_eq!(failure.kind, ErrorKind::InvalidQuestion);
        assert_eq!(status_for(failure.kind), StatusCode::BAD_REQUEST);

        assert_eq!(check_question(" Show me all customers ").unwrap(), "Show me all customers");
    }

    #[test]
    fn test_explain_flag_defaults_to_false() {
        let request: NlQueryRequest = serde_json::from_str(r#"{"query": "Show me all customers"}"#).unwrap();
        assert!(!request.explain_results);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::NonReadOperation), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::UnparseableQuery), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::ResultTooLarge), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::InvalidQuestion), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::PoolExhausted), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::SchemaUnavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::TranslationServiceError), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::ExecutionTimeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::ExecutionError), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_body_shape() {
        let body = ErrorResponse {
            error: ApiFailure::new(ErrorKind::PoolExhausted, "busy"),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"error": {"code": "POOL_EXHAUSTED", "message": "busy"}})
        );
    }
}
