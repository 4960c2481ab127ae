use std::cmp::Reverse;
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::{RuleCache, RunContext};
use crate::classifier::{Classification, JobGroup, PlannedJob, classify};
use crate::config::{Mode, RunConfig};
use crate::error::AppError;
use crate::extractor::{Extractor, JobOutput};
use crate::learner::{BackgroundLearner, LearningReport, LearningSet};
use crate::metrics::RunSummary;
use crate::models::{DocumentTexts, ExtractionResult, Job};
use crate::traits::{FieldOracle, PatternOracle, RuleStore};

/// Events emitted during a run for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RunEvent<'a> {
    Started {
        run_id: Uuid,
        mode: Mode,
        jobs: usize,
    },
    Classified {
        classification: &'a Classification,
    },
    /// A job's synchronous stage finished; its learner may still be running.
    JobCompleted {
        result: &'a ExtractionResult,
    },
    LearningAwaited {
        reports: &'a [LearningReport],
    },
    RulesSaved {
        rules: usize,
    },
    RulesSaveFailed {
        error: &'a AppError,
    },
    Finished {
        run_id: Uuid,
        summary: &'a RunSummary,
    },
}

/// Trait for receiving run events (decoupled logging).
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::Started { run_id, mode, jobs } => {
                tracing::info!(%run_id, %mode, jobs, "Run started");
            }
            RunEvent::Classified { classification } => {
                tracing::info!(
                    warm = classification.warm.len(),
                    orphan = classification.orphan.len(),
                    groups = classification.groups.len(),
                    "Batch classified"
                );
            }
            RunEvent::JobCompleted { result } => {
                let missing = result.fields.missing_fields().count();
                match &result.error {
                    Some(error) => tracing::warn!(
                        document_key = %result.document_key,
                        %error,
                        "Job failed"
                    ),
                    None => tracing::info!(
                        document_key = %result.document_key,
                        label = %result.label,
                        bucket = %result.bucket,
                        missing,
                        oracle_calls = result.metrics.data_calls,
                        "Job completed"
                    ),
                }
            }
            RunEvent::LearningAwaited { reports } => {
                let committed: usize = reports.iter().map(|r| r.committed.len()).sum();
                tracing::info!(learners = reports.len(), committed, "Background learning finished");
            }
            RunEvent::RulesSaved { rules } => {
                tracing::info!(rules, "Rules saved");
            }
            RunEvent::RulesSaveFailed { error } => {
                tracing::error!(%error, "Failed to save rules");
            }
            RunEvent::Finished { run_id, summary } => {
                tracing::info!(
                    %run_id,
                    documents = summary.documents,
                    failed = summary.failed_documents,
                    oracle_calls = summary.oracle_calls,
                    oracle_tokens = summary.oracle_tokens,
                    oracle_time_s = summary.oracle_time.as_secs_f64(),
                    missing_fields = summary.missing_fields,
                    "Run finished"
                );
            }
        }
    }
}

/// What a run hands back.
pub struct RunOutcome {
    /// One result per input job, in input order.
    pub results: Vec<ExtractionResult>,
    /// Learners still owned by the caller. Empty once the run has awaited them.
    pub learning: LearningSet,
    pub summary: RunSummary,
}

/// Runs a batch of jobs against one rule cache.
pub struct Scheduler<O, P, S>
where
    O: FieldOracle,
    P: PatternOracle,
    S: RuleStore,
{
    field_oracle: O,
    pattern_oracle: P,
    store: S,
    config: RunConfig,
}

impl<O, P, S> Scheduler<O, P, S>
where
    O: FieldOracle,
    P: PatternOracle,
    S: RuleStore,
{
    pub fn new(field_oracle: O, pattern_oracle: P, store: S, config: RunConfig) -> Self {
        Self {
            field_oracle,
            pattern_oracle,
            store,
            config,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Load the persisted rules into a fresh cache.
    pub async fn load_cache(&self) -> Result<RuleCache, AppError> {
        let rules = self.store.load().await?;
        Ok(RuleCache::from_rules(&rules))
    }

    /// Run the batch.
    ///
    /// Warm and orphan jobs run first, concurrently. Grouped jobs follow: one
    /// at a time in `standard` and `smart`, group-parallel in `pro` with each
    /// group's teacher finishing before its students start. Outside `standard`
    /// every background learner is awaited before the cache is saved.
    pub async fn run<R: RunReporter>(
        &self,
        jobs: &[Job],
        texts: &DocumentTexts,
        cache: RuleCache,
        reporter: &R,
    ) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let mode = self.config.mode;
        let started = Instant::now();
        reporter.report(RunEvent::Started {
            run_id,
            mode,
            jobs: jobs.len(),
        });

        let context = Arc::new(RunContext::new(cache));
        let classification = classify(jobs, &context.cache().snapshot(), mode);
        reporter.report(RunEvent::Classified {
            classification: &classification,
        });

        let learner = BackgroundLearner::new(
            self.pattern_oracle.clone(),
            context.clone(),
            self.config.learning_timeout,
        );
        let extractor = Extractor::new(
            context.clone(),
            self.field_oracle.clone(),
            learner,
            self.config.oracle_timeout,
        );

        let mut outputs: Vec<(usize, JobOutput)> = Vec::with_capacity(jobs.len());

        let immediate = classification.warm.iter().chain(classification.orphan.iter());
        outputs.extend(
            join_all(immediate.map(|p| self.run_job(&extractor, jobs, p, texts, reporter))).await,
        );

        match mode {
            Mode::Pro => {
                let groups = join_all(
                    classification
                        .groups
                        .iter()
                        .map(|g| self.run_group(&extractor, jobs, g, texts, reporter)),
                )
                .await;
                outputs.extend(groups.into_iter().flatten());
            }
            Mode::Smart | Mode::Standard => {
                let mut sequence: Vec<&PlannedJob> = classification
                    .groups
                    .iter()
                    .flat_map(|g| g.members.iter())
                    .collect();
                sequence.sort_by_key(|p| Reverse(p.plan.reusable_count()));
                for planned in sequence {
                    outputs.push(self.run_job(&extractor, jobs, planned, texts, reporter).await);
                }
            }
        }

        let mut learning = LearningSet::new();
        for (_, output) in &mut outputs {
            if let Some(handle) = output.learning.take() {
                learning.push(handle);
            }
        }
        if mode != Mode::Standard && !learning.is_empty() {
            let reports = std::mem::take(&mut learning).join_all().await;
            reporter.report(RunEvent::LearningAwaited { reports: &reports });
        }

        outputs.sort_by_key(|(index, _)| *index);
        let mut summary = RunSummary::default();
        let results: Vec<ExtractionResult> = outputs
            .into_iter()
            .map(|(_, output)| {
                let mut result = output.result;
                result.metrics = output.metrics.snapshot();
                summary.add(
                    &result.metrics,
                    result.fields.missing_fields().count(),
                    result.error.is_some(),
                );
                result
            })
            .collect();

        let rules = context.cache().snapshot();
        match self.store.save(&rules).await {
            Ok(()) => reporter.report(RunEvent::RulesSaved {
                rules: rules.values().map(|fields| fields.len()).sum(),
            }),
            Err(e) => reporter.report(RunEvent::RulesSaveFailed { error: &e }),
        }

        tracing::debug!(%run_id, elapsed_s = started.elapsed().as_secs_f64(), "Run complete");
        reporter.report(RunEvent::Finished {
            run_id,
            summary: &summary,
        });

        RunOutcome {
            results,
            learning,
            summary,
        }
    }

    /// Teacher first, then every student concurrently.
    async fn run_group<R: RunReporter>(
        &self,
        extractor: &Extractor<O, P>,
        jobs: &[Job],
        group: &JobGroup,
        texts: &DocumentTexts,
        reporter: &R,
    ) -> Vec<(usize, JobOutput)> {
        let Some((teacher, students)) = group.members.split_first() else {
            return Vec::new();
        };

        let mut outputs = vec![self.run_job(extractor, jobs, teacher, texts, reporter).await];
        outputs.extend(
            join_all(
                students
                    .iter()
                    .map(|s| self.run_job(extractor, jobs, s, texts, reporter)),
            )
            .await,
        );
        outputs
    }

    async fn run_job<R: RunReporter>(
        &self,
        extractor: &Extractor<O, P>,
        jobs: &[Job],
        planned: &PlannedJob,
        texts: &DocumentTexts,
        reporter: &R,
    ) -> (usize, JobOutput) {
        let job = &jobs[planned.index];
        let output = match texts.get(&job.document_key) {
            Some(text) => extractor.extract(job, Arc::clone(text), &planned.plan).await,
            None => {
                let e = AppError::MissingInputError(job.document_key.clone());
                JobOutput::failed(job, &planned.plan, &e)
            }
        };
        reporter.report(RunEvent::JobCompleted {
            result: &output.result,
        });
        (planned.index, output)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::Rules;
    use crate::models::{Bucket, FieldSchema};
    use crate::testutil::*;

    const CARD_1: &str = "NAME: Joana D'Arc\nID: 101943\nSTATUS: REGULAR";
    const CARD_2: &str = "NAME: Luis Filipe\nID: 227481\nSTATUS: PENDING";
    const CARD_3: &str = "NAME: Ana Souza\nID: 884120\nSTATUS: REGULAR";

    fn card_job(key: &str) -> Job {
        Job::new(
            key,
            "CARD",
            FieldSchema::new()
                .with_field("name", "Full name")
                .with_field("id", "Registration number"),
        )
    }

    fn texts(entries: &[(&str, &str)]) -> DocumentTexts {
        entries
            .iter()
            .map(|(k, t)| (k.to_string(), Arc::from(*t)))
            .collect()
    }

    fn card_oracle() -> ScriptedFieldOracle {
        ScriptedFieldOracle::new()
            .answer(CARD_1, "name", "Joana D'Arc")
            .answer(CARD_1, "id", "101943")
            .answer(CARD_2, "name", "Luis Filipe")
            .answer(CARD_2, "id", "227481")
            .answer(CARD_3, "name", "Ana Souza")
            .answer(CARD_3, "id", "884120")
    }

    fn card_patterns() -> ScriptedPatternOracle {
        ScriptedPatternOracle::new()
            .with_pattern("name", r"NAME:\s*([^\n]+)")
            .with_pattern("id", r"ID:\s*(\d+)")
    }

    fn scheduler(
        oracle: ScriptedFieldOracle,
        patterns: ScriptedPatternOracle,
        store: MemoryRuleStore,
        mode: Mode,
    ) -> Scheduler<ScriptedFieldOracle, ScriptedPatternOracle, MemoryRuleStore> {
        Scheduler::new(
            oracle,
            patterns,
            store,
            RunConfig::default()
                .with_mode(mode)
                .with_oracle_timeout(Duration::from_secs(5))
                .with_learning_timeout(Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn smart_run_learns_and_persists_patterns() {
        let oracle = card_oracle();
        let store = MemoryRuleStore::empty();
        let s = scheduler(oracle.clone(), card_patterns(), store.clone(), Mode::Smart);
        let jobs = vec![card_job("c1"), card_job("c2"), card_job("c3")];
        let reporter = MockReporter::new();

        let outcome = s
            .run(
                &jobs,
                &texts(&[("c1", CARD_1), ("c2", CARD_2), ("c3", CARD_3)]),
                RuleCache::new(),
                &reporter,
            )
            .await;

        assert_eq!(outcome.results.len(), 3);
        assert!(outcome.results.iter().all(|r| r.fields.is_complete()));
        assert_eq!(outcome.results[1].fields.get("name"), Some("Luis Filipe"));
        assert!(outcome.learning.is_empty());

        let saved = store.last_saved().unwrap();
        assert_eq!(saved["CARD"]["name"], r"NAME:\s*([^\n]+)");
        assert_eq!(saved["CARD"]["id"], r"ID:\s*(\d+)");

        // The teacher always asks; learners only commit patterns that reproduce values.
        assert_eq!(oracle.calls_for(CARD_1).len(), 1);
        // Learning commits in the background, so later jobs still ask for `name`.
        for text in [CARD_2, CARD_3] {
            let calls = oracle.calls_for(text);
            assert_eq!(calls.len(), 1);
            assert!(calls[0].fields.iter().any(|f| f == "name"));
        }
        assert!(outcome.results[0].metrics.pattern_calls >= 1);
        assert!(outcome.results[0].metrics.async_duration.is_some());

        let events = reporter.events.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some("Started"));
        assert!(events.contains(&"LearningAwaited".to_string()));
        assert!(events.contains(&"RulesSaved".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("Finished"));
    }

    #[tokio::test]
    async fn smart_runs_grouped_jobs_by_descending_reusable_fields() {
        let jobs = vec![
            Job::new("c1", "CARD", FieldSchema::new().with_field("name", "")),
            Job::new("c2", "CARD", FieldSchema::new().with_field("status", "")),
            card_job("c3"),
            card_job("c4"),
        ];
        let reporter = MockReporter::new();
        let s = scheduler(card_oracle(), card_patterns(), MemoryRuleStore::empty(), Mode::Smart);

        s.run(
            &jobs,
            &texts(&[("c1", CARD_1), ("c2", CARD_2), ("c3", CARD_3), ("c4", CARD_1)]),
            RuleCache::new(),
            &reporter,
        )
        .await;

        let completed = reporter.completed.lock().unwrap().clone();
        assert_eq!(completed, vec!["c3", "c4", "c1", "c2"]);
    }

    #[tokio::test]
    async fn warm_run_makes_no_oracle_calls() {
        let mut rules: Rules = rules_with("CARD", "name", r"NAME:\s*([^\n]+)");
        rules
            .get_mut("CARD")
            .unwrap()
            .insert("id".into(), r"ID:\s*(\d+)".into());
        let oracle = card_oracle();
        let patterns = card_patterns();
        let s = scheduler(oracle.clone(), patterns.clone(), MemoryRuleStore::empty(), Mode::Pro);
        let jobs = vec![card_job("c1"), card_job("c2")];

        let outcome = s
            .run(
                &jobs,
                &texts(&[("c1", CARD_1), ("c2", CARD_2)]),
                RuleCache::from_rules(&rules),
                &MockReporter::new(),
            )
            .await;

        assert!(oracle.calls().is_empty());
        assert!(patterns.calls().is_empty());
        assert!(outcome.results.iter().all(|r| r.bucket == Bucket::Warm));
        assert!(outcome.results.iter().all(|r| r.mode == Mode::Standard));
        assert_eq!(outcome.results[0].fields.get("id"), Some("101943"));
        assert_eq!(outcome.summary.oracle_calls, 0);
    }

    #[tokio::test]
    async fn standard_runs_are_deterministic_and_never_learn() {
        let rules = rules_with("CARD", "id", r"ID:\s*(\d+)");
        let jobs = vec![card_job("c1"), card_job("c2"), card_job("c3")];
        let input = texts(&[("c1", CARD_1), ("c2", CARD_2), ("c3", CARD_3)]);
        let patterns = card_patterns();

        let mut runs = Vec::new();
        for _ in 0..2 {
            let reporter = MockReporter::new();
            let s = scheduler(card_oracle(), patterns.clone(), MemoryRuleStore::empty(), Mode::Standard);
            let outcome = s
                .run(&jobs, &input, RuleCache::from_rules(&rules), &reporter)
                .await;
            let completed = reporter.completed.lock().unwrap().clone();
            assert_eq!(completed, vec!["c1", "c2", "c3"]);
            runs.push(outcome);
        }

        assert!(patterns.calls().is_empty());
        for (a, b) in runs[0].results.iter().zip(&runs[1].results) {
            assert_eq!(a.fields, b.fields);
            assert_eq!(a.metrics.data_calls, b.metrics.data_calls);
        }
        assert!(runs[0].results.iter().all(|r| r.metrics.async_duration.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn oracle_timeout_on_one_job_leaves_others_untouched() {
        let oracle = ScriptedFieldOracle::new()
            .answer(CARD_1, "name", "Joana D'Arc")
            .answer(CARD_1, "id", "101943")
            .answer(CARD_2, "name", "Luis Filipe")
            .answer(CARD_2, "id", "227481")
            .hang_on(CARD_2, Duration::from_secs(60));
        let jobs = vec![
            card_job("c1"),
            Job::new(
                "c2",
                "BADGE",
                FieldSchema::new().with_field("name", "").with_field("id", ""),
            ),
        ];
        let s = scheduler(oracle, card_patterns(), MemoryRuleStore::empty(), Mode::Pro);

        let outcome = s
            .run(
                &jobs,
                &texts(&[("c1", CARD_1), ("c2", CARD_2)]),
                RuleCache::new(),
                &MockReporter::new(),
            )
            .await;

        assert!(outcome.results[0].fields.is_complete());
        assert_eq!(outcome.results[1].fields.missing_fields().count(), 2);
        assert!(outcome.results[1].error.is_none());
        assert_eq!(outcome.results[1].metrics.data_calls, 1);
        assert_eq!(outcome.results[1].metrics.data_tokens, 0);
    }

    #[tokio::test]
    async fn pro_teacher_completes_before_students() {
        let jobs = vec![
            Job::new("c1", "CARD", FieldSchema::new().with_field("name", "")),
            card_job("c2"),
            card_job("c3"),
        ];
        let reporter = MockReporter::new();
        let s = scheduler(card_oracle(), card_patterns(), MemoryRuleStore::empty(), Mode::Pro);

        s.run(
            &jobs,
            &texts(&[("c1", CARD_1), ("c2", CARD_2), ("c3", CARD_3)]),
            RuleCache::new(),
            &reporter,
        )
        .await;

        let completed = reporter.completed.lock().unwrap().clone();
        assert_eq!(completed.first().map(String::as_str), Some("c2"));
        assert_eq!(completed.len(), 3);
    }

    #[tokio::test]
    async fn missing_text_yields_error_without_oracle_calls() {
        let oracle = card_oracle();
        let s = scheduler(oracle.clone(), card_patterns(), MemoryRuleStore::empty(), Mode::Smart);
        let jobs = vec![card_job("c1"), card_job("ghost")];

        let outcome = s
            .run(&jobs, &texts(&[("c1", CARD_1)]), RuleCache::new(), &MockReporter::new())
            .await;

        let ghost = &outcome.results[1];
        assert_eq!(ghost.document_key, "ghost");
        assert!(ghost.error.as_deref().unwrap().contains("ghost"));
        assert_eq!(ghost.metrics.oracle_calls(), 0);
        assert_eq!(oracle.calls().len(), 1);
        assert_eq!(outcome.summary.failed_documents, 1);
    }

    #[tokio::test]
    async fn save_failure_is_reported_not_fatal() {
        let reporter = MockReporter::new();
        let s = scheduler(
            card_oracle(),
            card_patterns(),
            MemoryRuleStore::with_save_error(),
            Mode::Smart,
        );

        let outcome = s
            .run(&[card_job("c1")], &texts(&[("c1", CARD_1)]), RuleCache::new(), &reporter)
            .await;

        assert!(outcome.results[0].fields.is_complete());
        let events = reporter.events.lock().unwrap().clone();
        assert!(events.contains(&"RulesSaveFailed".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("Finished"));
    }

    #[tokio::test]
    async fn load_cache_reads_from_store() {
        let store = MemoryRuleStore::with_rules(rules_with("CARD", "id", r"ID:\s*(\d+)"));
        let s = scheduler(card_oracle(), card_patterns(), store, Mode::Smart);

        let cache = s.load_cache().await.unwrap();

        assert!(cache.contains("CARD", "id"));
    }
}
