use serde::Serialize;

/// What is sent to the model: fixed instructions plus context, and the user turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    /// Size in characters of both parts together
    pub fn len(&self) -> usize {
        self.system.chars().count() + self.user.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.system.is_empty() && self.user.is_empty()
    }
}

/// The single SQL statement pulled out of a model response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    pub sql: String,
    /// Full model output, kept for diagnostics only
    pub raw_response: String,
}
