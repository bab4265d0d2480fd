use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::ErrorKind;

/// Trait for metrics backends. Implementations can forward to Prometheus,
/// StatsD, or simply log metrics.
pub trait MetricsBackend: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_gauge(&self, name: &str, value: f64);
    fn record_histogram(&self, name: &str, value: f64);
}

/// Generation counters, safe to share across concurrent refinement tasks.
#[derive(Default)]
pub struct GenerationMetrics {
    pub documents_started: AtomicU64,
    pub documents_completed: AtomicU64,
    pub documents_failed: AtomicU64,
    pub template_renders: AtomicU64,
    pub llm_refinements: AtomicU64,
    pub refinement_retries: AtomicU64,
    pub refinement_failures: AtomicU64,
    /// Accumulated LLM spend in millionths of a USD.
    pub cost_micro_usd: AtomicU64,
    backend: Option<Arc<dyn MetricsBackend>>,
}

impl std::fmt::Debug for GenerationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationMetrics")
            .field("snapshot", &self.snapshot())
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

impl GenerationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    fn bump(&self, counter: &AtomicU64, name: &str) {
        let val = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter(name, val);
        }
    }

    pub fn record_document_started(&self) {
        self.bump(&self.documents_started, "specgen.documents_started");
    }

    pub fn record_document_completed(&self, total_cost: f64) {
        self.bump(&self.documents_completed, "specgen.documents_completed");
        if let Some(backend) = &self.backend {
            backend.record_histogram("specgen.document_cost_usd", total_cost);
        }
    }

    pub fn record_document_failed(&self, kind: ErrorKind) {
        let val = self.documents_failed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter(&format!("specgen.documents_failed.{kind}"), val);
        }
    }

    pub fn record_template_render(&self) {
        self.bump(&self.template_renders, "specgen.template_renders");
    }

    /// An LLM case was accepted after `attempts` calls costing `cost` USD.
    pub fn record_refinement(&self, attempts: u32, cost: f64) {
        self.bump(&self.llm_refinements, "specgen.llm_refinements");
        let retries = u64::from(attempts.saturating_sub(1));
        if retries > 0 {
            self.refinement_retries.fetch_add(retries, Ordering::Relaxed);
        }
        let micros = (cost.max(0.0) * 1_000_000.0).round() as u64;
        let total = self.cost_micro_usd.fetch_add(micros, Ordering::Relaxed) + micros;
        if let Some(backend) = &self.backend {
            backend.record_histogram("specgen.refinement_attempts", f64::from(attempts));
            backend.record_gauge("specgen.cost_usd", total as f64 / 1_000_000.0);
        }
    }

    pub fn record_refinement_failure(&self) {
        self.bump(&self.refinement_failures, "specgen.refinement_failures");
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_started: self.documents_started.load(Ordering::Relaxed),
            documents_completed: self.documents_completed.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            template_renders: self.template_renders.load(Ordering::Relaxed),
            llm_refinements: self.llm_refinements.load(Ordering::Relaxed),
            refinement_retries: self.refinement_retries.load(Ordering::Relaxed),
            refinement_failures: self.refinement_failures.load(Ordering::Relaxed),
            cost_micro_usd: self.cost_micro_usd.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of generation metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub documents_started: u64,
    pub documents_completed: u64,
    pub documents_failed: u64,
    pub template_renders: u64,
    pub llm_refinements: u64,
    pub refinement_retries: u64,
    pub refinement_failures: u64,
    pub cost_micro_usd: u64,
}

/// Logging-based metrics backend. Emits metrics as structured log events.
pub struct LoggingMetricsBackend;

impl MetricsBackend for LoggingMetricsBackend {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::info!(metric = name, value, kind = "counter", "metric");
    }

    fn record_gauge(&self, name: &str, value: f64) {
        tracing::info!(metric = name, value, kind = "gauge", "metric");
    }

    fn record_histogram(&self, name: &str, value: f64) {
        tracing::info!(metric = name, value, kind = "histogram", "metric");
    }
}
