use crate::db::schema::{SchemaSnapshot, TableSchema};
use crate::llm::models::Prompt;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    #[error("question is empty")]
    EmptyQuestion,
}

/// Turns a question and the cached schema into a model prompt.
///
/// Output depends only on the arguments: the current time is passed in, not
/// read from the clock.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    max_prompt_chars: usize,
}

impl PromptBuilder {
    pub fn new(max_prompt_chars: usize) -> Self {
        Self { max_prompt_chars }
    }

    pub fn build(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        as_of: DateTime<Utc>,
    ) -> Result<Prompt, PromptError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PromptError::EmptyQuestion);
        }

        let instructions = instructions(&schema.schema_name, as_of);
        let budget = self
            .max_prompt_chars
            .saturating_sub(char_len(&instructions) + char_len(question));

        let listing = describe_schema(question, &schema.tables, budget);
        debug!(
            "Prompt schema listing is {} chars of a {} char budget",
            char_len(&listing),
            budget
        );

        Ok(Prompt::new(format!("{}{}", instructions, listing), question))
    }
}

fn instructions(schema_name: &str, as_of: DateTime<Utc>) -> String {
    format!(
        r#"### Instructions:
Your task is to convert a question into a SQL query for DuckDB, given a database schema.
Adhere to these rules:
- Generate exactly one read-only statement: SELECT, WITH, SHOW TABLES, DESCRIBE or EXPLAIN. Never insert, update, delete or change the schema.
- Use only the tables and columns listed below, spelled exactly as shown
- Use table aliases to prevent ambiguity, e.g. `SELECT o.id, c.name FROM orders o JOIN customers c ON o.customer_id = c.id`
- When creating a ratio, always cast the numerator as float
- Current date and time: {}. Use it for relative periods such as "today" or "last month".
- Return only the SQL query inside a ```sql code block, with no explanation

### Schema `{}`:
"#,
        as_of.format("%Y-%m-%d %H:%M:%S UTC"),
        schema_name
    )
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn omission_marker(omitted: usize) -> String {
    format!(
        "-- {} more table(s) omitted to fit the prompt size limit\n",
        omitted
    )
}

/// Lists every table when it fits, otherwise the tables most related to the
/// question followed by an omission marker.
fn describe_schema(question: &str, tables: &[TableSchema], budget: usize) -> String {
    let descriptions: Vec<String> = tables.iter().map(TableSchema::describe).collect();

    let full: String = descriptions.concat();
    if char_len(&full) <= budget {
        return full;
    }

    // Room for the marker, sized for the widest count it could show
    let reserve = char_len(&omission_marker(tables.len()));
    let mut remaining = budget.saturating_sub(reserve);

    let mut listing = String::new();
    let mut omitted = 0;
    for index in rank_tables(question, tables) {
        let description = &descriptions[index];
        let len = char_len(description);
        if len <= remaining {
            listing.push_str(description);
            remaining -= len;
        } else {
            omitted += 1;
        }
    }

    if omitted > 0 {
        listing.push_str(&omission_marker(omitted));
    }
    listing
}

/// Table indices ordered by relevance to the question, ties in catalog order.
fn rank_tables(question: &str, tables: &[TableSchema]) -> Vec<usize> {
    let tokens = question_tokens(question);

    let scores: Vec<usize> = tables
        .iter()
        .map(|table| {
            let mut name_terms = variants(&table.name);
            for part in table.name.split('_').filter(|p| !p.is_empty()) {
                name_terms.extend(variants(part));
            }
            let column_terms: Vec<HashSet<String>> =
                table.columns.iter().map(|c| variants(&c.name)).collect();

            tokens
                .iter()
                .map(|token| {
                    let forms = variants(token);
                    let mut score = 0;
                    if !forms.is_disjoint(&name_terms) {
                        score += 3;
                    }
                    if column_terms.iter().any(|c| !forms.is_disjoint(c)) {
                        score += 1;
                    }
                    score
                })
                .sum()
        })
        .collect();

    let mut order: Vec<usize> = (0..tables.len()).collect();
    // Stable sort keeps catalog order between equal scores
    order.sort_by(|a, b| scores[*b].cmp(&scores[*a]));
    order
}

fn question_tokens(question: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    question
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// The word plus its singular forms after dropping a plural `s` or `es`
fn variants(word: &str) -> HashSet<String> {
    let word = word.to_lowercase();
    let mut forms = HashSet::new();
    if word.len() > 4 {
        if let Some(stem) = word.strip_suffix("es") {
            forms.insert(stem.to_string());
        }
    }
    if word.len() > 3 {
        if let Some(stem) = word.strip_suffix('s') {
            forms.insert(stem.to_string());
        }
    }
    forms.insert(word);
    forms
}
