//! Background pattern learning.
//!
//! A learner is spawned per job once its synchronous stage has accepted values
//! for reusable fields. It asks the pattern oracle for one pattern per field,
//! keeps only patterns that reproduce the accepted value, and commits them
//! under the run lock. Failures never reach the job's result.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use crate::cache::{PatternRule, RunContext};
use crate::error::AppError;
use crate::metrics::MetricsCollector;
use crate::models::{Candidates, Synthesis, Usage};
use crate::traits::PatternOracle;

/// Everything a learner needs from the job that spawned it.
pub struct LearningRequest {
    pub document_key: String,
    pub label: String,
    pub text: Arc<str>,
    pub candidates: Candidates,
    /// The job's collector; pattern usage and async timing land here.
    pub metrics: MetricsCollector,
}

/// What one learner did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LearningReport {
    pub document_key: String,
    pub label: String,
    /// Fields whose pattern was validated and written to the cache.
    pub committed: Vec<String>,
    /// Fields whose proposed pattern failed to compile or to reproduce the value.
    pub rejected: Vec<String>,
    pub cancelled: bool,
    pub error: Option<String>,
}

enum Outcome {
    Answered(Synthesis),
    Failed(AppError),
    Cancelled,
}

/// Spawns learning tasks against one run's cache.
#[derive(Clone)]
pub struct BackgroundLearner<P: PatternOracle> {
    oracle: P,
    context: Arc<RunContext>,
    timeout: Duration,
}

impl<P: PatternOracle> BackgroundLearner<P> {
    pub fn new(oracle: P, context: Arc<RunContext>, timeout: Duration) -> Self {
        Self {
            oracle,
            context,
            timeout,
        }
    }

    /// Start learning on the runtime and hand back a handle to it.
    pub fn spawn(&self, request: LearningRequest) -> LearningHandle {
        let cancel = CancellationToken::new();
        let document_key = request.document_key.clone();
        let label = request.label.clone();

        let learner = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { learner.learn(request, token).await });

        LearningHandle {
            document_key,
            label,
            cancel,
            handle,
        }
    }

    /// Run one learning step to completion.
    ///
    /// Cancellation aborts the oracle call and skips the commit; usage and
    /// async timing are recorded either way.
    pub async fn learn(&self, request: LearningRequest, cancel: CancellationToken) -> LearningReport {
        let started = Instant::now();
        let mut report = LearningReport {
            document_key: request.document_key.clone(),
            label: request.label.clone(),
            ..LearningReport::default()
        };

        let outcome = tokio::select! {
            () = cancel.cancelled() => Outcome::Cancelled,
            res = timeout(self.timeout, self.oracle.synthesize(&request.text, &request.candidates)) => {
                match res {
                    Ok(Ok(synthesis)) => Outcome::Answered(synthesis),
                    Ok(Err(e)) => Outcome::Failed(e),
                    Err(_) => Outcome::Failed(AppError::OracleTimeout(self.timeout)),
                }
            }
        };

        let failed_usage = |tokens| Usage {
            tokens,
            duration: started.elapsed(),
        };
        let (usage, valid) = match outcome {
            Outcome::Answered(synthesis) => {
                let valid = self.validate(&request, &synthesis, &mut report);
                (synthesis.usage, valid)
            }
            Outcome::Failed(e) => {
                tracing::warn!(
                    document_key = %request.document_key,
                    label = %request.label,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Pattern synthesis failed"
                );
                report.error = Some(e.to_string());
                (failed_usage(e.billed_tokens()), Vec::new())
            }
            Outcome::Cancelled => {
                tracing::info!(document_key = %request.document_key, "Pattern learning cancelled");
                report.cancelled = true;
                (failed_usage(0), Vec::new())
            }
        };

        let guard = self.context.lock().await;
        request.metrics.record_pattern_call(usage);
        if !report.cancelled {
            for (field, rule) in valid {
                tracing::info!(
                    label = %request.label,
                    %field,
                    pattern = rule.as_str(),
                    "Learned pattern"
                );
                guard.set(&request.label, &field, rule);
                report.committed.push(field);
            }
        }
        request.metrics.finish_async(started.elapsed());
        drop(guard);

        report
    }

    /// Keep only patterns for requested fields that reproduce their reference value.
    fn validate(
        &self,
        request: &LearningRequest,
        synthesis: &Synthesis,
        report: &mut LearningReport,
    ) -> Vec<(String, PatternRule)> {
        let mut valid = Vec::new();
        for (field, candidate) in &request.candidates {
            let Some(pattern) = synthesis.patterns.get(field) else {
                continue;
            };
            let rule = match PatternRule::compile(pattern) {
                Ok(rule) => rule,
                Err(e) => {
                    tracing::debug!(%field, error = %e, "Rejected pattern");
                    report.rejected.push(field.clone());
                    continue;
                }
            };
            if rule.reproduces(&request.text, &candidate.reference_value) {
                valid.push((field.clone(), rule));
            } else {
                tracing::debug!(
                    %field,
                    %pattern,
                    reference = %candidate.reference_value,
                    "Rejected pattern: does not reproduce value"
                );
                report.rejected.push(field.clone());
            }
        }
        valid
    }
}

/// Handle to one spawned learner.
pub struct LearningHandle {
    document_key: String,
    label: String,
    cancel: CancellationToken,
    handle: JoinHandle<LearningReport>,
}

impl LearningHandle {
    pub fn document_key(&self) -> &str {
        &self.document_key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Ask the learner to stop. A learner that has not committed yet will not.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the learner. `None` if the task panicked.
    pub async fn join(self) -> Option<LearningReport> {
        match self.handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(
                    document_key = %self.document_key,
                    error = %e,
                    "Learning task did not complete"
                );
                None
            }
        }
    }
}

/// The learners spawned during one run.
#[derive(Default)]
pub struct LearningSet {
    handles: Vec<LearningHandle>,
}

impl LearningSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: LearningHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LearningHandle> {
        self.handles.iter()
    }

    pub fn cancel_all(&self) {
        for handle in &self.handles {
            handle.cancel();
        }
    }

    /// Wait for every learner; reports come back in spawn order.
    pub async fn join_all(self) -> Vec<LearningReport> {
        join_all(self.handles.into_iter().map(LearningHandle::join))
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}
