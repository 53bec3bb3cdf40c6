pub mod outcome;

use crate::config::AppConfig;
use crate::db::executor::QueryExecutor;
use crate::db::schema::SchemaSnapshot;
use crate::db::schema_manager::SchemaIntrospector;
use crate::llm::explain::ResultExplainer;
use crate::llm::prompt::{PromptBuilder, PromptError};
use crate::llm::translate::TranslationClient;
use crate::llm::LanguageModel;
use crate::sql::validator::{SafetyValidator, ValidationVerdict};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use self::outcome::{ApiFailure, ApiOutcome, QueryResponse, StageTimings};

/// One question on its way through the pipeline
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub question: String,
    pub want_explanation: bool,
    pub schema: Arc<SchemaSnapshot>,
}

/// Question in, rows (or exactly one failure) out.
///
/// Stages run strictly in order: schema, prompt, translation, validation,
/// execution, then the optional explanation. Only the schema cache outlives a
/// request.
pub struct Pipeline {
    introspector: SchemaIntrospector,
    prompts: PromptBuilder,
    translator: TranslationClient,
    validator: SafetyValidator,
    executor: QueryExecutor,
    explainer: ResultExplainer,
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl Pipeline {
    pub fn new(
        introspector: SchemaIntrospector,
        model: Arc<dyn LanguageModel>,
        executor: QueryExecutor,
        config: &AppConfig,
    ) -> Self {
        let max_prompt_chars = config.pipeline.max_prompt_chars;
        let timeout = config.llm.timeout();

        Self {
            introspector,
            prompts: PromptBuilder::new(max_prompt_chars),
            translator: TranslationClient::new(Arc::clone(&model), timeout),
            validator: SafetyValidator::new(config.pipeline.row_limit),
            executor,
            explainer: ResultExplainer::new(model, timeout, max_prompt_chars),
        }
    }

    pub async fn run(&self, question: &str, want_explanation: bool) -> ApiOutcome {
        match self.process(question, want_explanation).await {
            Ok(response) => ApiOutcome::Success(response),
            Err(failure) => {
                warn!("Request failed with {}", failure);
                ApiOutcome::Failure(failure)
            }
        }
    }

    async fn process(
        &self,
        question: &str,
        want_explanation: bool,
    ) -> Result<QueryResponse, ApiFailure> {
        let started = Instant::now();
        let mut timings = StageTimings::default();

        let question = question.trim();
        if question.is_empty() {
            return Err(PromptError::EmptyQuestion.into());
        }
        info!("Processing question: {}", question);

        let stage = Instant::now();
        let schema = self.introspector.get_schema().await?;
        timings.schema = elapsed_ms(stage);
        info!("Schema ready: {} tables", schema.table_count());

        let request = TranslationRequest {
            question: question.to_string(),
            want_explanation,
            schema,
        };

        let stage = Instant::now();
        let prompt = self
            .prompts
            .build(&request.question, &request.schema, Utc::now())?;
        timings.prompt = elapsed_ms(stage);
        info!("Prompt built: {} chars", prompt.len());

        let stage = Instant::now();
        let candidate = self.translator.translate(&prompt).await?;
        timings.translation = elapsed_ms(stage);
        info!("Candidate SQL: {}", candidate.sql);

        let stage = Instant::now();
        let query = match self.validator.validate(&candidate.sql, &request.schema) {
            ValidationVerdict::Accepted(query) => query,
            ValidationVerdict::Rejected(rejection) => return Err(rejection.into()),
        };
        timings.validation = elapsed_ms(stage);
        info!("Validated SQL: {}", query.sql());

        let stage = Instant::now();
        let result = self.executor.execute(&query).await?;
        timings.execution = elapsed_ms(stage);

        let explanation = if request.want_explanation {
            let stage = Instant::now();
            let explanation = match self
                .explainer
                .explain(&request.question, query.sql(), &result)
                .await
            {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!("Explanation unavailable: {}", e);
                    None
                }
            };
            timings.explanation = Some(elapsed_ms(stage));
            explanation
        } else {
            None
        };

        timings.total = elapsed_ms(started);
        info!(
            "Question answered with {} rows in {}ms",
            result.row_count, timings.total
        );

        Ok(QueryResponse {
            natural_language_query: request.question,
            sql_query: query.sql().to_string(),
            row_count: result.row_count,
            column_names: result.columns,
            result: result.rows,
            processing_time_ms: timings.total,
            stage_timings: timings,
            explanation,
        })
    }
}
