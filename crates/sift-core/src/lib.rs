pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod extractor;
pub mod learner;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod store;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{PatternRule, RuleCache, Rules, RunContext};
pub use classifier::{Classification, JobKey, classify};
pub use config::{Mode, RunConfig};
pub use error::AppError;
pub use extractor::{Extractor, JobPlan};
pub use learner::{BackgroundLearner, LearningReport, LearningSet};
pub use metrics::{Metrics, MetricsCollector, RunSummary};
pub use models::{
    Bucket, Candidate, Candidates, Confidence, DocumentTexts, ExtractionResult, FieldAnswer,
    FieldSchema, FieldValues, Inference, Job, Synthesis, Usage,
};
pub use scheduler::{RunEvent, RunOutcome, RunReporter, Scheduler, TracingRunReporter};
pub use store::JsonRuleStore;
pub use traits::{FieldOracle, PatternOracle, RuleStore, TextCleaner};
