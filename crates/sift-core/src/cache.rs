//! Learned pattern rules, keyed by `label → field`.
//!
//! Reads go straight to the cache through a short synchronous read lock and
//! may observe slightly stale state; a stale miss only costs an extra oracle
//! call. Writes are only reachable through a [`CommitGuard`], which holds the
//! run-scoped lock of the owning [`RunContext`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use regex::{Regex, RegexBuilder};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::AppError;

/// Persisted form of the cache: `label → field → pattern`.
pub type Rules = BTreeMap<String, BTreeMap<String, String>>;

/// Collapse runs of whitespace and case-fold, for comparing extracted values.
pub fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A compiled extraction pattern.
///
/// Patterns match in multi-line, dot-matches-newline mode. When the pattern
/// has a capture group, group 1 is the value; otherwise the whole match is.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pattern: String,
    regex: Regex,
}

impl PatternRule {
    pub fn compile(pattern: &str) -> Result<Self, AppError> {
        let regex = RegexBuilder::new(pattern)
            .multi_line(true)
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| AppError::PatternSyntaxError {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Run the pattern against `text`, returning the trimmed value if any.
    pub fn apply(&self, text: &str) -> Option<String> {
        let caps = self.regex.captures(text)?;
        let m = if self.regex.captures_len() > 1 {
            caps.get(1)?
        } else {
            caps.get(0)?
        };
        let value = m.as_str().trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    /// True if applying the pattern to `text` yields `reference` after normalization.
    pub fn reproduces(&self, text: &str, reference: &str) -> bool {
        self.apply(text)
            .is_some_and(|v| normalize(&v) == normalize(reference))
    }
}

type RuleMap = HashMap<String, HashMap<String, PatternRule>>;

/// Shared `label → field → pattern` store for one run.
#[derive(Debug, Default)]
pub struct RuleCache {
    rules: RwLock<RuleMap>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache from persisted rules, dropping patterns that no longer compile.
    pub fn from_rules(rules: &Rules) -> Self {
        let mut map = RuleMap::new();
        for (label, fields) in rules {
            for (field, pattern) in fields {
                match PatternRule::compile(pattern) {
                    Ok(rule) => {
                        map.entry(label.clone())
                            .or_default()
                            .insert(field.clone(), rule);
                    }
                    Err(e) => {
                        tracing::warn!(%label, %field, error = %e, "Dropping persisted pattern");
                    }
                }
            }
        }
        Self {
            rules: RwLock::new(map),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RuleMap> {
        self.rules.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rule cache");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, RuleMap> {
        self.rules.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rule cache");
            poisoned.into_inner()
        })
    }

    pub fn get(&self, label: &str, field: &str) -> Option<PatternRule> {
        self.read()
            .get(label)
            .and_then(|fields| fields.get(field))
            .cloned()
    }

    pub fn contains(&self, label: &str, field: &str) -> bool {
        self.read()
            .get(label)
            .is_some_and(|fields| fields.contains_key(field))
    }

    /// Number of active rules across all labels.
    pub fn len(&self) -> usize {
        self.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of every active pattern.
    pub fn snapshot(&self) -> Rules {
        self.read()
            .iter()
            .map(|(label, fields)| {
                let fields = fields
                    .iter()
                    .map(|(field, rule)| (field.clone(), rule.as_str().to_string()))
                    .collect();
                (label.clone(), fields)
            })
            .collect()
    }

    fn insert(&self, label: &str, field: &str, rule: PatternRule) -> Option<PatternRule> {
        self.write()
            .entry(label.to_string())
            .or_default()
            .insert(field.to_string(), rule)
    }
}

/// The rule cache of one run together with its run-scoped lock.
#[derive(Debug, Default)]
pub struct RunContext {
    cache: RuleCache,
    lock: Mutex<()>,
}

impl RunContext {
    pub fn new(cache: RuleCache) -> Self {
        Self {
            cache,
            lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &RuleCache {
        &self.cache
    }

    /// Acquire the run lock. All cache writes and background metric updates
    /// happen while a guard is alive.
    pub async fn lock(&self) -> CommitGuard<'_> {
        CommitGuard {
            cache: &self.cache,
            _held: self.lock.lock().await,
        }
    }
}

/// Proof that the run lock is held; the only way to write the cache.
pub struct CommitGuard<'a> {
    cache: &'a RuleCache,
    _held: MutexGuard<'a, ()>,
}

impl CommitGuard<'_> {
    /// Make `rule` the active pattern for `(label, field)`, returning the one it replaced.
    pub fn set(&self, label: &str, field: &str, rule: PatternRule) -> Option<PatternRule> {
        self.cache.insert(label, field, rule)
    }
}
