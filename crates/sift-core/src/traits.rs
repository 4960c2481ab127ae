use std::future::Future;

use crate::cache::Rules;
use crate::error::AppError;
use crate::models::{Candidates, FieldSchema, Inference, Synthesis};

/// Infers field values directly from document text (an LLM in practice).
pub trait FieldOracle: Send + Sync + Clone + 'static {
    /// Ask for every field in `fields`. Answers for fields that were not
    /// requested are ignored by the caller.
    fn infer(
        &self,
        text: &str,
        fields: &FieldSchema,
    ) -> impl Future<Output = Result<Inference, AppError>> + Send;
}

/// Synthesizes extraction patterns from text and known-good values.
pub trait PatternOracle: Send + Sync + Clone + 'static {
    /// One call covers the whole candidate set.
    fn synthesize(
        &self,
        text: &str,
        candidates: &Candidates,
    ) -> impl Future<Output = Result<Synthesis, AppError>> + Send;
}

/// Loads and saves the rule cache between runs.
pub trait RuleStore: Send + Sync + Clone {
    fn load(&self) -> impl Future<Output = Result<Rules, AppError>> + Send;

    fn save(&self, rules: &Rules) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Turns raw document text into the plain text the extractor consumes.
pub trait TextCleaner: Send + Sync + Clone {
    fn clean(&self, text: &str) -> Result<String, AppError>;
}
