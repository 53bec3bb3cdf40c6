use crate::db::executor::ExecutionResult;
use crate::llm::models::Prompt;
use crate::llm::{LanguageModel, LlmError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Rows shown to the model when summarizing a result
pub const MAX_EXPLAINED_ROWS: usize = 50;

const EXPLAIN_INSTRUCTIONS: &str = "You are a data analyst. Explain the result of a SQL query \
to a non-technical user in a few plain sentences. Answer the user's question directly, \
mention notable values or trends, and do not repeat the SQL or use markdown.";

#[derive(Debug, thiserror::Error)]
pub enum ExplainError {
    #[error("explanation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Service(#[from] LlmError),
    #[error("model returned an empty explanation")]
    Empty,
}

/// Asks the model for a prose summary of returned rows.
pub struct ResultExplainer {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    max_prompt_chars: usize,
}

impl ResultExplainer {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration, max_prompt_chars: usize) -> Self {
        Self {
            model,
            timeout,
            max_prompt_chars,
        }
    }

    pub async fn explain(
        &self,
        question: &str,
        sql: &str,
        result: &ExecutionResult,
    ) -> Result<String, ExplainError> {
        let prompt = self.build_prompt(question, sql, result);
        debug!("Explanation prompt is {} chars", prompt.len());

        let text = match tokio::time::timeout(self.timeout, self.model.complete(&prompt)).await {
            Ok(response) => response?,
            Err(_) => {
                warn!("Explanation timed out after {:?}", self.timeout);
                return Err(ExplainError::Timeout(self.timeout));
            }
        };

        let text = text.trim();
        if text.is_empty() {
            return Err(ExplainError::Empty);
        }
        Ok(text.to_string())
    }

    fn build_prompt(&self, question: &str, sql: &str, result: &ExecutionResult) -> Prompt {
        let mut user = format!(
            "Question: {}\nSQL: {}\nColumns: {}\nRow count: {}\nRows:\n",
            question,
            sql,
            result.columns.join(", "),
            result.row_count
        );

        let budget = self
            .max_prompt_chars
            .saturating_sub(EXPLAIN_INSTRUCTIONS.chars().count());
        let mut used = user.chars().count();
        let mut shown = 0;

        for row in result.rows.iter().take(MAX_EXPLAINED_ROWS) {
            let line = match serde_json::to_string(row) {
                Ok(line) => line,
                Err(_) => continue,
            };
            let len = line.chars().count() + 1;
            if used + len > budget {
                break;
            }
            user.push_str(&line);
            user.push('\n');
            used += len;
            shown += 1;
        }

        if shown < result.row_count {
            user.push_str(&format!("({} more rows not shown)\n", result.row_count - shown));
        }

        Prompt::new(EXPLAIN_INSTRUCTIONS, user)
    }
}
