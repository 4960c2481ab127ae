//! JSON file persistence for learned rules.
//!
//! The file is a plain `{label: {field: pattern}}` object. Older files may
//! hold a list of patterns per field, `<field>_blacklist` entries, or
//! unrelated top-level keys; those are read leniently and rewritten in the
//! plain form on the next save.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::cache::Rules;
use crate::error::AppError;
use crate::traits::RuleStore;

const BLACKLIST_SUFFIX: &str = "_blacklist";

/// Stores rules in a single JSON file.
#[derive(Debug, Clone)]
pub struct JsonRuleStore {
    path: PathBuf,
}

impl JsonRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse a rules document, skipping anything that is not a `label → field → pattern` entry.
pub fn parse_rules(content: &str) -> Result<Rules, AppError> {
    if content.trim().is_empty() {
        return Ok(Rules::new());
    }

    let root: Value = serde_json::from_str(content)?;
    let Value::Object(labels) = root else {
        return Err(AppError::StoreError(
            "rules file must contain a JSON object".into(),
        ));
    };

    let mut rules = Rules::new();
    for (label, fields) in labels {
        let Value::Object(fields) = fields else {
            tracing::debug!(%label, "Skipping non-object entry in rules file");
            continue;
        };
        for (field, entry) in fields {
            if field.ends_with(BLACKLIST_SUFFIX) {
                continue;
            }
            let pattern = match entry {
                Value::String(p) => Some(p),
                Value::Array(items) => items
                    .into_iter()
                    .rev()
                    .find_map(|v| v.as_str().map(str::to_string)),
                _ => None,
            };
            match pattern {
                Some(p) => {
                    rules.entry(label.clone()).or_default().insert(field, p);
                }
                None => tracing::debug!(%label, %field, "Skipping unusable rule entry"),
            }
        }
    }
    Ok(rules)
}

impl RuleStore for JsonRuleStore {
    async fn load(&self) -> Result<Rules, AppError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "Rules file not found, starting empty");
                return Ok(Rules::new());
            }
            Err(e) => {
                return Err(AppError::StoreError(format!(
                    "Failed to read {}: {e}",
                    self.path.display()
                )));
            }
        };

        let rules = parse_rules(&content)?;
        tracing::info!(
            path = %self.path.display(),
            labels = rules.len(),
            "Loaded rules"
        );
        Ok(rules)
    }

    async fn save(&self, rules: &Rules) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::StoreError(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let json = serde_json::to_string_pretty(rules)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(|e| {
            AppError::StoreError(format!("Failed to write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            AppError::StoreError(format!("Failed to replace {}: {e}", self.path.display()))
        })?;

        tracing::debug!(path = %self.path.display(), "Saved rules");
        Ok(())
    }
}
