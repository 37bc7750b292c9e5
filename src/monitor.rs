//! Latency and throughput samples with rule-based routing recommendations
//!
//! What this module provides
//! - `PerformanceMonitor`: per-model sample ring buffers and the heuristics
//!   derived from them
//!
//! Exports
//! - Models
//!   - `MetricEvent` (what callers report), `MetricSample` (what is stored)
//!   - `SwitchRule` and `Recommendation`
//!
//! Implementation strategy
//! - Buffers are a `Mutex<HashMap<model, VecDeque>>`; appends are serialized,
//!   each buffer capped at `MAX_SAMPLES` with FIFO eviction
//! - Recommendations come from an explicit rule table injected at
//!   construction, so the heuristic stays auditable and testable in
//!   isolation; there is no learning loop

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Ring-buffer depth per model.
const MAX_SAMPLES: usize = 100;

/// A completed call as reported by the caller.
#[derive(Debug, Clone)]
pub struct MetricEvent {
    /// Missing labels are filed under `"unknown"`.
    pub model: Option<String>,
    pub latency_ms: f64,
    pub token_count: u64,
}

/// A stored observation. Read-only after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub model_id: String,
    pub latency_ms: f64,
    pub token_count: u64,
    pub tokens_per_second: f64,
    pub timestamp: DateTime<Utc>,
}

/// One row of the switch heuristic: when `from`'s mean latency exceeds the
/// threshold, recommend moving to `to`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRule {
    pub from: String,
    pub to: String,
    pub latency_threshold_ms: f64,
    pub expected_improvement: String,
    pub confidence: f64,
}

impl SwitchRule {
    /// The rule the production pool shipped with: shed load from the mid-size
    /// model onto its lighter sibling once it slows down.
    pub fn default_rules() -> Vec<SwitchRule> {
        vec![SwitchRule {
            from: "llama3.2:3b".into(),
            to: "llama3.2:1b".into(),
            latency_threshold_ms: 5000.0,
            expected_improvement: "2.5x speed".into(),
            confidence: 0.85,
        }]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    SwitchModel,
}

/// Derived, not persisted; recomputed on demand from the current buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: RecommendedAction,
    pub model_id: String,
    pub from: String,
    pub to: String,
    pub expected_improvement: String,
    pub confidence: f64,
}

/// Records call metrics and derives optimization recommendations.
pub struct PerformanceMonitor {
    samples: Mutex<HashMap<String, VecDeque<MetricSample>>>,
    rules: Vec<SwitchRule>,
}

impl PerformanceMonitor {
    pub fn new(rules: Vec<SwitchRule>) -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
            rules,
        }
    }

    /// Append a sample for the event's model, evicting the oldest entry once
    /// the buffer holds `MAX_SAMPLES`.
    pub fn record(&self, event: MetricEvent) {
        let model = event.model.unwrap_or_else(|| "unknown".to_string());
        let tokens_per_second = if event.latency_ms > 0.0 {
            event.token_count as f64 / (event.latency_ms / 1000.0)
        } else {
            0.0
        };
        let sample = MetricSample {
            model_id: model.clone(),
            latency_ms: event.latency_ms,
            token_count: event.token_count,
            tokens_per_second,
            timestamp: Utc::now(),
        };
        debug!(model = %model, latency_ms = event.latency_ms, tps = tokens_per_second, "metric recorded");

        let mut samples = self.samples.lock().expect("monitor lock");
        let buf = samples.entry(model).or_default();
        if buf.len() == MAX_SAMPLES {
            buf.pop_front();
        }
        buf.push_back(sample);
    }

    /// Tokens per second: the LATEST sample for a specific model, or the
    /// unweighted mean over every stored sample when no model is given.
    /// Returns 0 when there is no data.
    pub fn tps(&self, model_id: Option<&str>) -> f64 {
        let samples = self.samples.lock().expect("monitor lock");
        match model_id {
            Some(id) => samples
                .get(id)
                .and_then(|buf| buf.back())
                .map(|s| s.tokens_per_second)
                .unwrap_or(0.0),
            None => {
                let mut sum = 0.0;
                let mut count = 0usize;
                for buf in samples.values() {
                    for s in buf {
                        sum += s.tokens_per_second;
                        count += 1;
                    }
                }
                if count == 0 {
                    0.0
                } else {
                    sum / count as f64
                }
            }
        }
    }

    /// Scan every model's buffer against the rule table.
    pub fn recommendations(&self) -> Vec<Recommendation> {
        let samples = self.samples.lock().expect("monitor lock");
        let mut out = Vec::new();
        for (model, buf) in samples.iter() {
            if buf.is_empty() {
                continue;
            }
            let mean_latency =
                buf.iter().map(|s| s.latency_ms).sum::<f64>() / buf.len() as f64;
            for rule in &self.rules {
                if rule.from == *model && mean_latency > rule.latency_threshold_ms {
                    out.push(Recommendation {
                        action: RecommendedAction::SwitchModel,
                        model_id: model.clone(),
                        from: rule.from.clone(),
                        to: rule.to.clone(),
                        expected_improvement: rule.expected_improvement.clone(),
                        confidence: rule.confidence,
                    });
                }
            }
        }
        out
    }

    /// Current buffers, for dashboards and tests.
    pub fn snapshot(&self) -> HashMap<String, Vec<MetricSample>> {
        let samples = self.samples.lock().expect("monitor lock");
        samples
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect()
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(SwitchRule::default_rules())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(model: &str, latency_ms: f64, tokens: u64) -> MetricEvent {
        MetricEvent {
            model: Some(model.to_string()),
            latency_ms,
            token_count: tokens,
        }
    }

    #[test]
    fn tps_for_model_is_latest_sample_not_average() {
        let mon = PerformanceMonitor::default();
        mon.record(event("m", 100.0, 10)); // 100 TPS
        mon.record(event("m", 200.0, 20)); // 100 TPS
        mon.record(event("m", 300.0, 30)); // 100 TPS
        assert_eq!(mon.tps(Some("m")), 100.0);
        mon.record(event("m", 100.0, 50)); // 500 TPS, now latest
        assert_eq!(mon.tps(Some("m")), 500.0);
    }

    #[test]
    fn tps_without_model_is_mean_across_all_samples() {
        let mon = PerformanceMonitor::default();
        mon.record(event("a", 1000.0, 100)); // 100 TPS
        mon.record(event("a", 1000.0, 200)); // 200 TPS
        mon.record(event("b", 1000.0, 600)); // 600 TPS
        assert_eq!(mon.tps(None), 300.0);
    }

    #[test]
    fn tps_is_zero_without_data() {
        let mon = PerformanceMonitor::default();
        assert_eq!(mon.tps(Some("missing")), 0.0);
        assert_eq!(mon.tps(None), 0.0);
    }

    #[test]
    fn zero_latency_yields_zero_tps() {
        let mon = PerformanceMonitor::default();
        mon.record(event("m", 0.0, 50));
        assert_eq!(mon.tps(Some("m")), 0.0);
    }

    #[test]
    fn missing_model_label_files_under_unknown() {
        let mon = PerformanceMonitor::default();
        mon.record(MetricEvent {
            model: None,
            latency_ms: 100.0,
            token_count: 10,
        });
        assert!(mon.snapshot().contains_key("unknown"));
    }

    #[test]
    fn buffer_caps_at_limit_evicting_oldest() {
        let mon = PerformanceMonitor::default();
        for i in 0..(MAX_SAMPLES as u64 + 20) {
            mon.record(event("m", 1000.0, i));
        }
        let snap = mon.snapshot();
        let buf = &snap["m"];
        assert_eq!(buf.len(), MAX_SAMPLES);
        // The 20 oldest samples were dropped.
        assert_eq!(buf.first().unwrap().token_count, 20);
        assert_eq!(buf.last().unwrap().token_count, MAX_SAMPLES as u64 + 19);
    }

    #[test]
    fn slow_heavy_model_triggers_switch_recommendation() {
        let mon = PerformanceMonitor::default();
        for _ in 0..3 {
            mon.record(event("llama3.2:3b", 6000.0, 100));
        }
        let recs = mon.recommendations();
        assert_eq!(recs.len(), 1);
        let rec = &recs[0];
        assert_eq!(rec.action, RecommendedAction::SwitchModel);
        assert_eq!(rec.from, "llama3.2:3b");
        assert_eq!(rec.to, "llama3.2:1b");
        assert_eq!(rec.confidence, 0.85);
    }

    #[test]
    fn fast_model_triggers_nothing() {
        let mon = PerformanceMonitor::default();
        mon.record(event("llama3.2:3b", 800.0, 100));
        assert!(mon.recommendations().is_empty());
    }

    #[test]
    fn rules_only_fire_for_their_model() {
        let mon = PerformanceMonitor::new(vec![SwitchRule {
            from: "big".into(),
            to: "small".into(),
            latency_threshold_ms: 1000.0,
            expected_improvement: "3x speed".into(),
            confidence: 0.9,
        }]);
        mon.record(event("other", 9000.0, 10));
        assert!(mon.recommendations().is_empty());
        mon.record(event("big", 2000.0, 10));
        assert_eq!(mon.recommendations().len(), 1);
    }
}
