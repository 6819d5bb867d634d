use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

pub(crate) const JOBS_PROCESSED: &str = "jobs_processed";
pub(crate) const JOBS_RETRIED: &str = "jobs_retried";
pub(crate) const JOBS_FAILED: &str = "jobs_failed";
pub(crate) const JOBS_INFLIGHT: &str = "jobs_inflight";

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled || PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

/// Sorted label pairs; the identity of one series within a metric.
pub(crate) type LabelKey = Vec<(String, String)>;

#[derive(Default)]
struct Series {
    counters: HashMap<&'static str, BTreeMap<LabelKey, u64>>,
    gauges: HashMap<&'static str, BTreeMap<LabelKey, f64>>,
}

/// In-memory counters and gauges owned by one worker instance.
///
/// Every update is mirrored into the `metrics` facade so a Prometheus recorder,
/// when installed, sees the same series. Reads only consult local state.
#[derive(Clone, Default)]
pub(crate) struct MetricsRegistry {
    inner: Arc<Mutex<Series>>,
}

impl MetricsRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment_counter(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        self.increment_counter_by(name, 1, labels);
    }

    pub(crate) fn increment_counter_by(
        &self,
        name: &'static str,
        amount: u64,
        labels: &[(&'static str, &str)],
    ) {
        if amount == 0 {
            return;
        }
        let key = label_key(labels);
        {
            let mut series = self.lock();
            *series.counters.entry(name).or_default().entry(key).or_insert(0) += amount;
        }
        let facade_labels = facade_labels(labels);
        metrics::counter!(name, &facade_labels).increment(amount);
    }

    /// Adds `delta` to a gauge, never letting it drop below zero.
    pub(crate) fn adjust_gauge(&self, name: &'static str, delta: f64, labels: &[(&'static str, &str)]) {
        let key = label_key(labels);
        let value = {
            let mut series = self.lock();
            let slot = series.gauges.entry(name).or_default().entry(key).or_insert(0.0);
            *slot = (*slot + delta).max(0.0);
            *slot
        };
        let facade_labels = facade_labels(labels);
        metrics::gauge!(name, &facade_labels).set(value);
    }

    #[cfg(test)]
    pub(crate) fn counter_value(&self, name: &str, labels: &[(&'static str, &str)]) -> u64 {
        let key = label_key(labels);
        self.lock().counters.get(name).and_then(|values| values.get(&key)).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn gauge_value(&self, name: &str, labels: &[(&'static str, &str)]) -> f64 {
        let key = label_key(labels);
        self.lock().gauges.get(name).and_then(|values| values.get(&key)).copied().unwrap_or(0.0)
    }

    #[cfg(test)]
    pub(crate) fn counter_snapshot(&self, name: &str) -> BTreeMap<LabelKey, u64> {
        self.lock().counters.get(name).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Series> {
        // A poisoned registry still holds valid numbers.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn label_key(labels: &[(&'static str, &str)]) -> LabelKey {
    let mut key: LabelKey =
        labels.iter().map(|(name, value)| (name.to_string(), value.to_string())).collect();
    key.sort();
    key
}

fn facade_labels(labels: &[(&'static str, &str)]) -> Vec<(&'static str, String)> {
    labels.iter().map(|(name, value)| (*name, value.to_string())).collect()
}
