use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout};

use crate::cache::RunContext;
use crate::config::Mode;
use crate::error::AppError;
use crate::learner::{BackgroundLearner, LearningHandle, LearningRequest};
use crate::metrics::MetricsCollector;
use crate::models::{
    Bucket, Candidate, Candidates, ExtractionResult, FieldValues, Job, Usage,
};
use crate::traits::{FieldOracle, PatternOracle};

/// How the scheduler wants one job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPlan {
    pub bucket: Bucket,
    /// Effective mode; warm jobs are forced to `standard`.
    pub mode: Mode,
    /// Fields of this job whose `(label, field)` pair appears in at least two jobs of the batch.
    pub reusable_fields: HashSet<String>,
}

impl JobPlan {
    pub fn new(bucket: Bucket, mode: Mode) -> Self {
        Self {
            bucket,
            mode,
            reusable_fields: HashSet::new(),
        }
    }

    pub fn with_reusable_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reusable_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn reusable_count(&self) -> usize {
        self.reusable_fields.len()
    }
}

/// What one job hands back to the scheduler.
pub struct JobOutput {
    pub result: ExtractionResult,
    /// Background learner spawned for this job, if any field was worth learning.
    pub learning: Option<LearningHandle>,
    pub metrics: MetricsCollector,
}

impl JobOutput {
    /// Output for a job that could not run at all.
    pub fn failed(job: &Job, plan: &JobPlan, error: &AppError) -> Self {
        let metrics = MetricsCollector::new();
        Self {
            result: ExtractionResult {
                document_key: job.document_key.clone(),
                label: job.label.clone(),
                bucket: plan.bucket,
                mode: plan.mode,
                fields: FieldValues::missing(&job.field_schema),
                metrics: metrics.snapshot(),
                sync_duration: Duration::ZERO,
                error: Some(error.to_string()),
            },
            learning: None,
            metrics,
        }
    }
}

/// Per-document pipeline: cached rules, then the oracle, then learning selection.
///
/// Never fails: oracle errors and timeouts leave fields missing and are logged.
pub struct Extractor<O, P>
where
    O: FieldOracle,
    P: PatternOracle,
{
    context: Arc<RunContext>,
    oracle: O,
    learner: BackgroundLearner<P>,
    oracle_timeout: Duration,
}

impl<O, P> Extractor<O, P>
where
    O: FieldOracle,
    P: PatternOracle,
{
    pub fn new(
        context: Arc<RunContext>,
        oracle: O,
        learner: BackgroundLearner<P>,
        oracle_timeout: Duration,
    ) -> Self {
        Self {
            context,
            oracle,
            learner,
            oracle_timeout,
        }
    }

    /// Run the synchronous stages for one job.
    ///
    /// 1. Apply cached rules for the job's label
    /// 2. Ask the oracle once for whatever is still missing
    /// 3. Spawn a learner for accepted, reusable, not-yet-cached fields
    pub async fn extract(&self, job: &Job, text: Arc<str>, plan: &JobPlan) -> JobOutput {
        let start = Instant::now();
        let metrics = MetricsCollector::new();
        let mut fields = FieldValues::missing(&job.field_schema);

        let hits = self.apply_cached_rules(job, &text, &mut fields);
        tracing::debug!(
            document_key = %job.document_key,
            label = %job.label,
            hits,
            "Applied cached rules"
        );

        let accepted = if fields.is_complete() {
            Vec::new()
        } else {
            self.ask_oracle(job, &text, &mut fields, &metrics).await
        };

        let candidates = if plan.mode.permits_learning() {
            self.select_candidates(job, &accepted, plan)
        } else {
            Candidates::new()
        };

        let sync_duration = start.elapsed();
        metrics.finish_sync(sync_duration);

        let learning = if candidates.is_empty() {
            None
        } else {
            tracing::info!(
                document_key = %job.document_key,
                label = %job.label,
                fields = candidates.len(),
                "Spawning pattern learner"
            );
            Some(self.learner.spawn(LearningRequest {
                document_key: job.document_key.clone(),
                label: job.label.clone(),
                text,
                candidates,
                metrics: metrics.clone(),
            }))
        };

        JobOutput {
            result: ExtractionResult {
                document_key: job.document_key.clone(),
                label: job.label.clone(),
                bucket: plan.bucket,
                mode: plan.mode,
                fields,
                metrics: metrics.snapshot(),
                sync_duration,
                error: None,
            },
            learning,
            metrics,
        }
    }

    /// Fill fields from the cache. Returns the number of fields resolved.
    fn apply_cached_rules(&self, job: &Job, text: &str, fields: &mut FieldValues) -> usize {
        let cache = self.context.cache();
        let mut hits = 0;
        for field in job.field_schema.names() {
            let Some(rule) = cache.get(&job.label, field) else {
                continue;
            };
            match rule.apply(text) {
                Some(value) => {
                    tracing::debug!(label = %job.label, %field, pattern = rule.as_str(), "Rule matched");
                    fields.set(field, value);
                    hits += 1;
                }
                None => {
                    tracing::debug!(label = %job.label, %field, "Rule did not match");
                }
            }
        }
        hits
    }

    /// Ask the oracle for the missing fields. Returns the accepted `(field, value)` pairs.
    async fn ask_oracle(
        &self,
        job: &Job,
        text: &str,
        fields: &mut FieldValues,
        metrics: &MetricsCollector,
    ) -> Vec<(String, String)> {
        let missing: Vec<String> = fields.missing_fields().map(str::to_string).collect();
        let request = job.field_schema.subset(missing.iter().map(String::as_str));

        let started = Instant::now();
        let inference = match timeout(self.oracle_timeout, self.oracle.infer(text, &request)).await
        {
            Ok(Ok(inference)) => inference,
            Ok(Err(e)) => {
                self.record_failed_call(job, metrics, started, &e);
                return Vec::new();
            }
            Err(_) => {
                let e = AppError::OracleTimeout(self.oracle_timeout);
                self.record_failed_call(job, metrics, started, &e);
                return Vec::new();
            }
        };
        metrics.record_data_call(inference.usage);

        let mut accepted = Vec::new();
        for field in request.names() {
            let Some(answer) = inference.answers.get(field) else {
                continue;
            };
            match answer.accepted_value() {
                Some(value) => {
                    fields.set(field, value.to_string());
                    accepted.push((field.to_string(), value.to_string()));
                }
                None => {
                    tracing::debug!(
                        document_key = %job.document_key,
                        %field,
                        confidence = ?answer.confidence,
                        "Oracle answer rejected"
                    );
                }
            }
        }

        tracing::info!(
            document_key = %job.document_key,
            requested = request.len(),
            accepted = accepted.len(),
            "Oracle extraction complete"
        );
        accepted
    }

    fn record_failed_call(
        &self,
        job: &Job,
        metrics: &MetricsCollector,
        started: Instant,
        error: &AppError,
    ) {
        metrics.record_data_call(Usage {
            tokens: error.billed_tokens(),
            duration: started.elapsed(),
        });
        tracing::warn!(
            document_key = %job.document_key,
            label = %job.label,
            error = %error,
            retryable = error.is_retryable(),
            "Oracle extraction failed, leaving fields missing"
        );
    }

    fn select_candidates(
        &self,
        job: &Job,
        accepted: &[(String, String)],
        plan: &JobPlan,
    ) -> Candidates {
        let cache = self.context.cache();
        accepted
            .iter()
            .filter(|(field, _)| plan.reusable_fields.contains(field))
            .filter(|(field, _)| !cache.contains(&job.label, field))
            .map(|(field, value)| {
                let description = job
                    .field_schema
                    .description(field)
                    .unwrap_or_default()
                    .to_string();
                (
                    field.clone(),
                    Candidate {
                        reference_value: value.clone(),
                        description,
                    },
                )
            })
            .collect()
    }
}
