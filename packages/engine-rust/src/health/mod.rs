//! Pluggable periodic health checks over the engine's subsystems.
//!
//! Hosts register probes per [`HealthCheckKind`]; a checker thread runs
//! each at its configured interval, applies failure / recovery thresholds,
//! and maintains an aggregate verdict. Callbacks fire per check and when
//! the aggregate changes.

mod checker;
mod probes;

pub use checker::{HealthChecker, OverallCallback, StatusCallback};
pub use probes::{DiskSpaceProbe, MemoryPoolProbe, PersistenceProbe, QueueDepthProbe};

use std::collections::BTreeMap;

/// What a check observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthCheckKind {
    /// Queue depths vs capacity.
    Queue,
    /// Persistence files and timings.
    Persistence,
    /// Pool utilization.
    Memory,
    /// Data directory writability.
    Disk,
    /// Host-supplied network probe.
    Network,
    /// Host-supplied database probe.
    Database,
    /// Anything else the host registers.
    Custom,
}

impl HealthCheckKind {
    /// Stable name for logs and details maps.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Persistence => "persistence",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Database => "database",
            Self::Custom => "custom",
        }
    }
}

/// Severity of a single observation or of the aggregate.
///
/// Ordered by precedence: the aggregate takes the worst verdict present,
/// with `Critical` outranking `Unhealthy` outranking `Degraded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthVerdict {
    /// Operating normally.
    Healthy,
    /// Functioning with reduced headroom.
    Degraded,
    /// Not functioning correctly.
    Unhealthy,
    /// Failing in a way that threatens the whole engine.
    Critical,
    /// No observation yet.
    #[default]
    Unknown,
}

impl HealthVerdict {
    /// Stable name for logs and details maps.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
        }
    }

    fn is_failure(self) -> bool {
        matches!(self, Self::Unhealthy | Self::Critical)
    }
}

/// One probe observation.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    /// The observed severity.
    pub verdict: HealthVerdict,
    /// Human-readable summary.
    pub message: String,
    /// Structured details (counts, paths, utilizations).
    pub details: BTreeMap<String, String>,
}

impl ProbeReport {
    /// A healthy observation with the given summary.
    #[must_use]
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            verdict: HealthVerdict::Healthy,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    /// An observation with the given severity and summary.
    #[must_use]
    pub fn with_verdict(verdict: HealthVerdict, message: impl Into<String>) -> Self {
        Self {
            verdict,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    /// Adds a detail entry, builder style.
    #[must_use]
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// A registered health probe.
pub trait HealthProbe: Send + Sync {
    /// Runs one observation. Must not block for long; the checker thread
    /// runs probes serially.
    fn probe(&self) -> ProbeReport;
}

/// Per-check configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Which subsystem the check observes.
    pub kind: HealthCheckKind,
    /// Interval between runs.
    pub interval_ms: u64,
    /// Consecutive failures before the published verdict turns unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive successes before the published verdict recovers.
    pub healthy_threshold: u32,
    /// Disabled checks stay registered but never run.
    pub enabled: bool,
}

impl HealthCheckConfig {
    /// Defaults: 30 s interval, 3 failures to trip, 2 successes to clear.
    #[must_use]
    pub fn new(kind: HealthCheckKind) -> Self {
        Self {
            kind,
            interval_ms: 30_000,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            enabled: true,
        }
    }

    /// Sets the run interval, builder style.
    #[must_use]
    pub fn every_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }
}

/// Published status of one check, including its counters.
#[derive(Debug, Clone, Default)]
pub struct HealthCheckStatus {
    /// Published verdict after threshold smoothing.
    pub verdict: HealthVerdict,
    /// Summary from the latest observation.
    pub message: String,
    /// Details from the latest observation.
    pub details: BTreeMap<String, String>,
    /// Wall-clock ms of the latest run.
    pub last_check_ms: u64,
    /// Wall-clock ms of the latest success.
    pub last_success_ms: u64,
    /// Wall-clock ms of the latest failure.
    pub last_failure_ms: u64,
    /// Current run of failures.
    pub consecutive_failures: u32,
    /// Current run of successes.
    pub consecutive_successes: u32,
    /// Total runs.
    pub total_checks: u64,
    /// Total failed runs.
    pub total_failures: u64,
    /// Duration of the latest run, ms.
    pub response_time_ms: u64,
}

impl HealthCheckStatus {
    /// Fraction of runs that succeeded, 0.0 before the first run.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            (self.total_checks - self.total_failures) as f64 / self.total_checks as f64
        }
    }
}

/// The aggregate across all registered checks.
#[derive(Debug, Clone, Default)]
pub struct OverallHealth {
    /// Worst verdict present, by precedence.
    pub verdict: HealthVerdict,
    /// Summary naming the checks that dragged the verdict down.
    pub message: String,
    /// Wall-clock ms of the last aggregate update.
    pub last_update_ms: u64,
    /// Registered checks.
    pub total_checks: usize,
    /// Checks currently healthy.
    pub healthy_checks: usize,
    /// Checks currently degraded.
    pub degraded_checks: usize,
    /// Checks currently unhealthy.
    pub unhealthy_checks: usize,
    /// Checks currently critical.
    pub critical_checks: usize,
    /// Messages of the non-healthy checks.
    pub issues: Vec<String>,
}
