use crate::llm::models::{CandidateQuery, Prompt};
use crate::llm::{LanguageModel, LlmError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Leading words that mark a line as the start of a SQL statement.
///
/// Write and DDL keywords are included so such statements are extracted and
/// then rejected by validation instead of silently skipped.
const STATEMENT_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "SHOW", "DESCRIBE", "EXPLAIN", "VALUES", "INSERT", "UPDATE", "DELETE",
    "MERGE", "UPSERT", "REPLACE", "CREATE", "ALTER", "DROP", "TRUNCATE", "ATTACH", "DETACH",
    "COPY", "EXPORT", "IMPORT", "INSTALL", "LOAD", "PRAGMA", "SET", "CALL", "GRANT", "REVOKE",
    "VACUUM", "CHECKPOINT",
];

#[derive(Debug, thiserror::Error)]
pub enum TranslationError {
    #[error("language model did not answer within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Service(#[from] LlmError),
    #[error("no SQL statement found in the model response")]
    NoQueryExtracted { raw_response: String },
}

/// Sends a prompt to the model and pulls one SQL statement out of the answer.
pub struct TranslationClient {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl TranslationClient {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub async fn translate(&self, prompt: &Prompt) -> Result<CandidateQuery, TranslationError> {
        let started = Instant::now();
        debug!("Prompt system part:\n{}", prompt.system);

        let raw_response =
            match tokio::time::timeout(self.timeout, self.model.complete(prompt)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    error!("Language model call failed: {}", e);
                    return Err(TranslationError::Service(e));
                }
                Err(_) => {
                    warn!("Language model timed out after {:?}", self.timeout);
                    return Err(TranslationError::Timeout(self.timeout));
                }
            };

        debug!("Raw model response: {}", raw_response);

        match extract_sql(&raw_response) {
            Some(sql) => {
                info!(
                    "Model {} produced SQL in {}ms",
                    self.model.model_id(),
                    started.elapsed().as_millis()
                );
                Ok(CandidateQuery { sql, raw_response })
            }
            None => {
                warn!("Could not find SQL in the model response");
                Err(TranslationError::NoQueryExtracted { raw_response })
            }
        }
    }
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

fn starts_with_keyword(line: &str) -> bool {
    let first = line
        .trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("");
    STATEMENT_KEYWORDS
        .iter()
        .any(|kw| kw.eq_ignore_ascii_case(first))
}

/// Pulls the first SQL statement out of free-form model output.
///
/// A non-empty fenced code block wins; otherwise the first line that starts
/// with a statement keyword, continued until a blank line, a fence, or a line
/// ending in `;`.
pub fn extract_sql(response: &str) -> Option<String> {
    fenced_block(response).or_else(|| keyword_lines(response))
}

fn fenced_block(response: &str) -> Option<String> {
    let mut lines = response.lines();

    while lines.by_ref().any(is_fence) {
        // The opening fence's language tag is ignored
        let body: Vec<&str> = lines.by_ref().take_while(|l| !is_fence(l)).collect();
        let sql = body.join("\n").trim().to_string();
        if !sql.is_empty() {
            return Some(sql);
        }
    }

    None
}

fn keyword_lines(response: &str) -> Option<String> {
    let lines: Vec<&str> = response.lines().collect();
    let start = lines.iter().position(|l| starts_with_keyword(l))?;

    let mut statement = Vec::new();
    for line in &lines[start..] {
        if line.trim().is_empty() || is_fence(line) {
            break;
        }
        statement.push(line.trim_end());
        if line.trim_end().ends_with(';') {
            break;
        }
    }

    Some(statement.join("\n").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct ScriptedModel {
        response: Result<String, String>,
        delay: Duration,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _prompt: &Prompt) -> Result<String, LlmError> {
            tokio::time::sleep(self.delay).await;
            self.response.clone().map_err(LlmError::ConnectionError)
        }

        fn model_id(&self) -> &str {
            "scripted"
        }
    }

    fn client(response: Result<&str, &str>, delay: Duration) -> TranslationClient {
        let model = ScriptedModel {
            response: response.map(str::to_string).map_err(str::to_string),
            delay,
        };
        TranslationClient::new(Arc::new(model), Duration::from_millis(100))
    }

    fn prompt() -> Prompt {
        Prompt::new("instructions", "Show me all customers")
    }

    #[test]
    fn test_fenced_block_with_language_tag() {
        let response = "Here you go:\n```sql\nSELECT *\nFROM customers;\n```\nHope it helps.";
        assert_eq!(
            extract_sql(response).as_deref(),
            Some("SELECT *\nFROM customers;")
        );
    }

    #[test]
    fn test_first_non_empty_fence_wins() {
        let response = "```\n\n```\nthen\n```\nSELECT 1\n```\n```sql\nSELECT 2\n```";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn test_unclosed_fence_runs_to_end() {
        let response = "```sql\nSELECT id FROM orders";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT id FROM orders"));
    }

    #[test]
    fn test_keyword_line_stops_at_semicolon() {
        let response = "The query is:\nselect name\nfrom customers;\nSELECT 2;";
        assert_eq!(
            extract_sql(response).as_deref(),
            Some("select name\nfrom customers;")
        );
    }

    #[test]
    fn test_keyword_line_stops_at_blank_line() {
        let response = "WITH t AS (SELECT 1)\nSELECT * FROM t\n\nThis returns one row.";
        assert_eq!(
            extract_sql(response).as_deref(),
            Some("WITH t AS (SELECT 1)\nSELECT * FROM t")
        );
    }

    #[test]
    fn test_write_statements_are_still_extracted() {
        assert_eq!(
            extract_sql("DELETE FROM customers WHERE id=1").as_deref(),
            Some("DELETE FROM customers WHERE id=1")
        );
    }

    #[test]
    fn test_prose_only_yields_nothing() {
        assert_eq!(extract_sql("I cannot answer that question."), None);
        assert_eq!(extract_sql("Selection of rows is not possible"), None);
        assert_eq!(extract_sql(""), None);
    }

    #[tokio::test]
    async fn test_translate_returns_candidate_and_raw_response() {
        let raw = "```sql\nSELECT * FROM customers\n```";
        let candidate = client(Ok(raw), Duration::ZERO)
            .translate(&prompt())
            .await
            .unwrap();

        assert_eq!(candidate.sql, "SELECT * FROM customers");
        assert_eq!(candidate.raw_response, raw);
    }

    #[tokio::test]
    async fn test_translate_times_out() {
        let err = client(Ok("SELECT 1"), Duration::from_secs(5))
            .translate(&prompt())
            .await
            .unwrap_err();
        assert!(matches!(err, TranslationError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_translate_surfaces_service_errors() {
        let err = client(Err("connection refused"), Duration::ZERO)
            .translate(&prompt())
            .await
            .unwrap_err();
        assert!(matches!(err, TranslationError::Service(LlmError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_translate_without_sql() {
        let err = client(Ok("Sorry, no idea."), Duration::ZERO)
            .translate(&prompt())
            .await
            .unwrap_err();
        assert!(
            matches!(err, TranslationError::NoQueryExtracted { raw_response } if raw_response == "Sorry, no idea.")
        );
    }
}
