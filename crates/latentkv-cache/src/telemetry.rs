//! Telemetry hooks for cache activity.
//!
//! Provides:
//! - [`StepMetrics`]: per-step batch width, hit/miss split, latency
//! - [`TelemetryHook`] trait: callback interface for real-time reporting
//! - [`StepTimer`]: records one inference step and computes metrics
//! - [`NoopTelemetry`] / [`LogTelemetry`]: built-in hook implementations

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use latentkv_kv::Device;
use serde::Serialize;

use crate::index::SlotRef;
use crate::pool::PoolClass;

/// Which entry point ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Initial,
    Recurrent,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Initial => write!(f, "initial"),
            StepKind::Recurrent => write!(f, "recurrent"),
        }
    }
}

/// Result of one memoized lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupOutcome {
    /// Served from the environment's init pool.
    InitHit,
    /// Served from the shared recurrent pool.
    RecurrentHit,
    Miss,
    /// An entry existed but its slot had been reused.
    StaleMiss,
}

impl LookupOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, LookupOutcome::InitHit | LookupOutcome::RecurrentHit)
    }
}

/// Summary of one inference step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepMetrics {
    pub kind: StepKind,
    #[serde(skip)]
    pub device: Device,
    pub batch_width: usize,
    pub hits: usize,
    pub misses: usize,
    pub elapsed_ms: f64,
}

/// Callback trait for cache telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called after each memoized lookup for environment `env`.
    fn on_lookup(&self, _kind: StepKind, _env: usize, _outcome: LookupOutcome) {}

    /// Called after a context is written to the init or recurrent pool.
    fn on_store(&self, _class: PoolClass, _slot: SlotRef) {}

    /// Called when a stored context had its window shrunk.
    fn on_window_shrink(&self, _env: usize) {}

    /// Called when a step finishes with its metrics.
    fn on_step_complete(&self, _metrics: &StepMetrics) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Keeps the metrics of the last completed step.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<StepMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics of the last completed step.
    pub fn last_metrics(&self) -> Option<StepMetrics> {
        self.last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_step_complete(&self, metrics: &StepMetrics) {
        *self
            .last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(metrics.clone());
    }
}

/// Times one inference step and counts its lookups.
pub struct StepTimer {
    kind: StepKind,
    device: Device,
    batch_width: usize,
    start: Instant,
    hits: usize,
    misses: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl StepTimer {
    pub fn new(
        kind: StepKind,
        device: Device,
        batch_width: usize,
        hook: Arc<dyn TelemetryHook>,
    ) -> Self {
        Self {
            kind,
            device,
            batch_width,
            start: Instant::now(),
            hits: 0,
            misses: 0,
            hook,
        }
    }

    /// Count a lookup. Fires `on_lookup`.
    pub fn record(&mut self, env: usize, outcome: LookupOutcome) {
        if outcome.is_hit() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        self.hook.on_lookup(self.kind, env, outcome);
    }

    /// Finalize and return metrics. Fires `on_step_complete`.
    pub fn finish(self) -> StepMetrics {
        let metrics = StepMetrics {
            kind: self.kind,
            device: self.device,
            batch_width: self.batch_width,
            hits: self.hits,
            misses: self.misses,
            elapsed_ms: self.start.elapsed().as_secs_f64() * 1000.0,
        };
        self.hook.on_step_complete(&metrics);
        metrics
    }
}
