//! Per-document oracle cost and timing.
//!
//! A [`MetricsCollector`] is shared between a job's synchronous stage and its
//! background learner. Background writes happen while the run lock is held;
//! the scheduler reads the final snapshot once both stages are done.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::models::Usage;

/// Serialize a `Duration` as fractional seconds.
pub fn as_secs<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64())
}

fn as_opt_secs<S: Serializer>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => serializer.serialize_some(&d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

/// Oracle cost and timing for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    #[serde(rename = "llm_data_calls")]
    pub data_calls: u32,
    #[serde(rename = "llm_data_tokens")]
    pub data_tokens: u64,
    #[serde(rename = "llm_data_time_s", serialize_with = "as_secs")]
    pub data_time: Duration,
    #[serde(rename = "llm_regex_calls")]
    pub pattern_calls: u32,
    #[serde(rename = "llm_regex_tokens")]
    pub pattern_tokens: u64,
    #[serde(rename = "llm_regex_time_s", serialize_with = "as_secs")]
    pub pattern_time: Duration,
    #[serde(rename = "sync_time_s", serialize_with = "as_secs")]
    pub sync_duration: Duration,
    #[serde(rename = "async_time_s", serialize_with = "as_opt_secs")]
    pub async_duration: Option<Duration>,
    #[serde(rename = "total_time_s", serialize_with = "as_secs")]
    pub total_duration: Duration,
}

impl Metrics {
    pub fn record_data_call(&mut self, usage: Usage) {
        self.data_calls += 1;
        self.data_tokens += usage.tokens;
        self.data_time += usage.duration;
    }

    pub fn record_pattern_call(&mut self, usage: Usage) {
        self.pattern_calls += 1;
        self.pattern_tokens += usage.tokens;
        self.pattern_time += usage.duration;
    }

    pub fn oracle_calls(&self) -> u32 {
        self.data_calls + self.pattern_calls
    }

    pub fn oracle_tokens(&self) -> u64 {
        self.data_tokens + self.pattern_tokens
    }

    pub fn oracle_time(&self) -> Duration {
        self.data_time + self.pattern_time
    }
}

/// Shared, cloneable handle to one document's [`Metrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Metrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> MutexGuard<'_, Metrics> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned metrics mutex");
            poisoned.into_inner()
        })
    }

    pub fn record_data_call(&self, usage: Usage) {
        self.lock_inner().record_data_call(usage);
    }

    pub fn record_pattern_call(&self, usage: Usage) {
        self.lock_inner().record_pattern_call(usage);
    }

    /// Record the end of the synchronous stage. Total equals sync until a learner finishes.
    pub fn finish_sync(&self, sync_duration: Duration) {
        let mut m = self.lock_inner();
        m.sync_duration = sync_duration;
        m.total_duration = sync_duration;
    }

    /// Record the end of the background stage: `total = sync + async`.
    pub fn finish_async(&self, async_duration: Duration) {
        let mut m = self.lock_inner();
        m.async_duration = Some(async_duration);
        m.total_duration = m.sync_duration + async_duration;
    }

    pub fn snapshot(&self) -> Metrics {
        self.lock_inner().clone()
    }
}

/// Totals across a whole run, for the end-of-run log line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub documents: usize,
    pub failed_documents: usize,
    pub oracle_calls: u32,
    pub oracle_tokens: u64,
    #[serde(serialize_with = "as_secs")]
    pub oracle_time: Duration,
    pub data_calls: u32,
    pub pattern_calls: u32,
    pub missing_fields: usize,
}

impl RunSummary {
    pub fn add(&mut self, metrics: &Metrics, missing_fields: usize, failed: bool) {
        self.documents += 1;
        if failed {
            self.failed_documents += 1;
        }
        self.oracle_calls += metrics.oracle_calls();
        self.oracle_tokens += metrics.oracle_tokens();
        self.oracle_time += metrics.oracle_time();
        self.data_calls += metrics.data_calls;
        self.pattern_calls += metrics.pattern_calls;
        self.missing_fields += missing_fields;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(tokens: u64, ms: u64) -> Usage {
        Usage {
            tokens,
            duration: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_records_both_call_kinds() {
        let collector = MetricsCollector::new();
        collector.record_data_call(usage(100, 250));
        collector.record_pattern_call(usage(40, 500));
        collector.record_pattern_call(usage(0, 20));

        let m = collector.snapshot();
        assert_eq!(m.data_calls, 1);
        assert_eq!(m.data_tokens, 100);
        assert_eq!(m.pattern_calls, 2);
        assert_eq!(m.pattern_tokens, 40);
        assert_eq!(m.oracle_calls(), 3);
        assert_eq!(m.oracle_time(), Duration::from_millis(770));
    }

    #[test]
    fn test_total_is_sync_plus_async() {
        let collector = MetricsCollector::new();
        collector.finish_sync(Duration::from_millis(300));
        assert_eq!(collector.snapshot().total_duration, Duration::from_millis(300));
        assert_eq!(collector.snapshot().async_duration, None);

        collector.finish_async(Duration::from_millis(700));
        let m = collector.snapshot();
        assert_eq!(m.async_duration, Some(Duration::from_millis(700)));
        assert_eq!(m.total_duration, Duration::from_secs(1));
    }

    #[test]
    fn test_clones_share_state() {
        let collector = MetricsCollector::new();
        let background = collector.clone();
        background.record_pattern_call(usage(10, 1));
        assert_eq!(collector.snapshot().pattern_calls, 1);
    }

    #[test]
    fn test_serialized_field_names() {
        let mut m = Metrics::default();
        m.record_data_call(usage(12, 1500));
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["llm_data_calls"], 1);
        assert_eq!(json["llm_data_tokens"], 12);
        assert_eq!(json["llm_data_time_s"], 1.5);
        assert!(json["async_time_s"].is_null());
    }

    #[test]
    fn test_run_summary_accumulates() {
        let mut m = Metrics::default();
        m.record_data_call(usage(100, 10));
        let mut summary = RunSummary::default();
        summary.add(&m, 1, false);
        summary.add(&Metrics::default(), 2, true);

        assert_eq!(summary.documents, 2);
        assert_eq!(summary.failed_documents, 1);
        assert_eq!(summary.oracle_calls, 1);
        assert_eq!(summary.missing_fields, 3);
    }
}
