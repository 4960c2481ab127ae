//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::Rules;
use crate::error::AppError;
use crate::models::{
    Candidates, Confidence, FieldAnswer, FieldSchema, Inference, Synthesis, Usage,
};
use crate::scheduler::{RunEvent, RunReporter};
use crate::traits::{FieldOracle, PatternOracle, RuleStore};

const TOKENS_PER_FIELD: u64 = 10;

// ---------------------------------------------------------------------------
// ScriptedFieldOracle
// ---------------------------------------------------------------------------

/// One recorded `infer` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldCall {
    pub text: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone)]
enum Failure {
    Protocol,
    Malformed(u64),
    Hang(Duration),
}

/// Field oracle answering from a per-text script.
///
/// Fields with no scripted answer for the given text are left out of the
/// response, as a real oracle omitting them would.
#[derive(Clone, Default)]
pub struct ScriptedFieldOracle {
    answers: Arc<Mutex<HashMap<String, HashMap<String, FieldAnswer>>>>,
    failures: Arc<Mutex<HashMap<String, Failure>>>,
    calls: Arc<Mutex<Vec<FieldCall>>>,
}

impl ScriptedFieldOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `field` for `text` with high confidence.
    pub fn answer(self, text: &str, field: &str, value: &str) -> Self {
        self.answer_with(text, field, FieldAnswer::new(value, Confidence::High))
    }

    pub fn answer_with(self, text: &str, field: &str, answer: FieldAnswer) -> Self {
        self.answers
            .lock()
            .unwrap()
            .entry(text.to_string())
            .or_default()
            .insert(field.to_string(), answer);
        self
    }

    /// Return a protocol error for every call on `text`.
    pub fn fail_on(self, text: &str) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(text.to_string(), Failure::Protocol);
        self
    }

    /// Bill `tokens` for every call on `text`, then fail to parse the answer.
    pub fn malformed_on(self, text: &str, tokens: u64) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(text.to_string(), Failure::Malformed(tokens));
        self
    }

    /// Sleep for `delay` before answering calls on `text`.
    pub fn hang_on(self, text: &str, delay: Duration) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(text.to_string(), Failure::Hang(delay));
        self
    }

    pub fn calls(&self) -> Vec<FieldCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, text: &str) -> Vec<FieldCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.text == text)
            .collect()
    }
}

impl FieldOracle for ScriptedFieldOracle {
    async fn infer(&self, text: &str, fields: &FieldSchema) -> Result<Inference, AppError> {
        self.calls.lock().unwrap().push(FieldCall {
            text: text.to_string(),
            fields: fields.names().map(str::to_string).collect(),
        });

        let failure = self.failures.lock().unwrap().get(text).cloned();
        match failure {
            Some(Failure::Protocol) => {
                return Err(AppError::OracleProtocolError("scripted failure".into()));
            }
            Some(Failure::Malformed(tokens)) => {
                return Err(AppError::MalformedAnswer {
                    message: "scripted failure".into(),
                    tokens,
                });
            }
            Some(Failure::Hang(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let script = self
            .answers
            .lock()
            .unwrap()
            .get(text)
            .cloned()
            .unwrap_or_default();
        let answers = fields
            .names()
            .filter_map(|f| script.get(f).map(|a| (f.to_string(), a.clone())))
            .collect();

        Ok(Inference {
            answers,
            usage: Usage {
                tokens: TOKENS_PER_FIELD * fields.len() as u64,
                duration: Duration::from_millis(1),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedPatternOracle
// ---------------------------------------------------------------------------

/// One recorded `synthesize` call.
#[derive(Debug, Clone)]
pub struct PatternCall {
    pub text: String,
    pub candidates: Candidates,
}

/// Pattern oracle returning a fixed pattern per field for every text.
#[derive(Clone, Default)]
pub struct ScriptedPatternOracle {
    patterns: Arc<Mutex<HashMap<String, String>>>,
    delay: Option<Duration>,
    failing: bool,
    calls: Arc<Mutex<Vec<PatternCall>>>,
}

impl ScriptedPatternOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern(self, field: &str, pattern: &str) -> Self {
        self.patterns
            .lock()
            .unwrap()
            .insert(field.to_string(), pattern.to_string());
        self
    }

    /// Sleep for `delay` before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Return a protocol error for every call.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn calls(&self) -> Vec<PatternCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl PatternOracle for ScriptedPatternOracle {
    async fn synthesize(&self, text: &str, candidates: &Candidates) -> Result<Synthesis, AppError> {
        self.calls.lock().unwrap().push(PatternCall {
            text: text.to_string(),
            candidates: candidates.clone(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing {
            return Err(AppError::OracleProtocolError("scripted failure".into()));
        }

        let scripted = self.patterns.lock().unwrap().clone();
        let patterns = candidates
            .keys()
            .filter_map(|f| scripted.get(f).map(|p| (f.clone(), p.clone())))
            .collect();

        Ok(Synthesis {
            patterns,
            usage: Usage {
                tokens: TOKENS_PER_FIELD * candidates.len() as u64,
                duration: Duration::from_millis(1),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryRuleStore
// ---------------------------------------------------------------------------

/// In-memory rule store recording every save.
#[derive(Clone, Default)]
pub struct MemoryRuleStore {
    initial: Rules,
    pub saved: Arc<Mutex<Vec<Rules>>>,
    save_error: bool,
}

impl MemoryRuleStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Rules) -> Self {
        Self {
            initial: rules,
            ..Self::default()
        }
    }

    /// Store that returns an error on save.
    pub fn with_save_error() -> Self {
        Self {
            save_error: true,
            ..Self::default()
        }
    }

    pub fn last_saved(&self) -> Option<Rules> {
        self.saved.lock().unwrap().last().cloned()
    }
}

impl RuleStore for MemoryRuleStore {
    async fn load(&self) -> Result<Rules, AppError> {
        Ok(self.initial.clone())
    }

    async fn save(&self, rules: &Rules) -> Result<(), AppError> {
        if self.save_error {
            return Err(AppError::StoreError("disk full".into()));
        }
        self.saved.lock().unwrap().push(rules.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Run reporter that records events.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
    /// Document keys in the order their synchronous stage completed.
    pub completed: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunReporter for MockReporter {
    fn report(&self, event: RunEvent<'_>) {
        let label = match &event {
            RunEvent::Started { .. } => "Started",
            RunEvent::Classified { .. } => "Classified",
            RunEvent::JobCompleted { result } => {
                self.completed
                    .lock()
                    .unwrap()
                    .push(result.document_key.clone());
                "JobCompleted"
            }
            RunEvent::LearningAwaited { .. } => "LearningAwaited",
            RunEvent::RulesSaved { .. } => "RulesSaved",
            RunEvent::RulesSaveFailed { .. } => "RulesSaveFailed",
            RunEvent::Finished { .. } => "Finished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Rules with a single `(label, field) → pattern` entry.
pub fn rules_with(label: &str, field: &str, pattern: &str) -> Rules {
    let mut rules = Rules::new();
    rules
        .entry(label.to_string())
        .or_default()
        .insert(field.to_string(), pattern.to_string());
    rules
}
