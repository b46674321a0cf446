//! Built-in probes over the engine's own subsystems.

use std::path::PathBuf;
use std::sync::Arc;

use super::{HealthProbe, HealthVerdict, ProbeReport};
use crate::persistence::MessageStore;
use crate::store::QueueStore;
use crate::substrate::PerformanceSubstrate;

/// Flags queues running close to their configured capacity.
pub struct QueueDepthProbe {
    queues: Arc<QueueStore>,
}

impl QueueDepthProbe {
    /// Degraded above this fill fraction.
    const DEGRADED_FILL: f64 = 0.9;

    /// Probe over the given registry.
    #[must_use]
    pub fn new(queues: Arc<QueueStore>) -> Self {
        Self { queues }
    }
}

impl HealthProbe for QueueDepthProbe {
    #[allow(clippy::cast_precision_loss)]
    fn probe(&self) -> ProbeReport {
        let names = self.queues.list_queues();
        let mut worst = HealthVerdict::Healthy;
        let mut report = ProbeReport::healthy(format!("{} queues", names.len()));
        for name in names {
            let Ok(info) = self.queues.queue_info(&name) else {
                continue;
            };
            if info.config.max_size == 0 {
                continue;
            }
            let fill = info.stats.current_count() as f64 / info.config.max_size as f64;
            if fill >= 1.0 {
                worst = HealthVerdict::Unhealthy;
                report = report.detail(name.clone(), "full");
            } else if fill >= Self::DEGRADED_FILL {
                if worst == HealthVerdict::Healthy {
                    worst = HealthVerdict::Degraded;
                }
                report = report.detail(name.clone(), format!("{:.0}% full", fill * 100.0));
            }
        }
        report.verdict = worst;
        if worst != HealthVerdict::Healthy {
            report.message = "queues near or at capacity".into();
        }
        report
    }
}

/// Observes the persistence engine: availability plus read/write timings.
pub struct PersistenceProbe {
    store: Arc<dyn MessageStore>,
}

impl PersistenceProbe {
    /// Average write latency above which persistence counts as degraded.
    const SLOW_WRITE_MS: f64 = 50.0;

    /// Probe over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

impl HealthProbe for PersistenceProbe {
    fn probe(&self) -> ProbeReport {
        if !self.store.is_initialized() {
            return ProbeReport::with_verdict(
                HealthVerdict::Critical,
                "persistence is not initialized",
            );
        }
        let stats = self.store.stats();
        let avg_write = stats.average_write_ms();
        let mut report = ProbeReport::healthy("persistence responsive")
            .detail("writes", stats.write_count.to_string())
            .detail("reads", stats.read_count.to_string())
            .detail("avg_write_ms", format!("{avg_write:.2}"))
            .detail(
                "persisted_bytes",
                self.store.total_persisted_size().to_string(),
            );
        if avg_write > Self::SLOW_WRITE_MS {
            report.verdict = HealthVerdict::Degraded;
            report.message = format!("writes averaging {avg_write:.1} ms");
        }
        report
    }
}

/// Observes buffer-pool pressure.
pub struct MemoryPoolProbe {
    substrate: Arc<PerformanceSubstrate>,
}

impl MemoryPoolProbe {
    /// Degraded above this fraction of the pool byte cap.
    const DEGRADED_UTILIZATION: f64 = 0.8;

    /// Probe over the given substrate.
    #[must_use]
    pub fn new(substrate: Arc<PerformanceSubstrate>) -> Self {
        Self { substrate }
    }
}

impl HealthProbe for MemoryPoolProbe {
    #[allow(clippy::cast_precision_loss)]
    fn probe(&self) -> ProbeReport {
        let stats = self.substrate.stats();
        let mut report = ProbeReport::healthy("pools nominal")
            .detail("outstanding_bytes", stats.memory.outstanding_bytes.to_string())
            .detail("pool_hits", stats.memory.pool_hits.to_string())
            .detail("pooled_messages", stats.messages.pooled.to_string())
            .detail("open_batches", stats.open_batches.to_string());
        if stats.memory.refused_allocations > 0 {
            report.verdict = HealthVerdict::Unhealthy;
            report.message = format!(
                "{} allocations refused at the pool cap",
                stats.memory.refused_allocations
            );
        } else if stats.memory.max_bytes > 0 {
            let utilization =
                stats.memory.outstanding_bytes as f64 / stats.memory.max_bytes as f64;
            if utilization >= Self::DEGRADED_UTILIZATION {
                report.verdict = HealthVerdict::Degraded;
                report.message = format!("pool at {:.0}% of its cap", utilization * 100.0);
            }
        }
        report
    }
}

/// Verifies the data directory exists and is writable.
pub struct DiskSpaceProbe {
    data_dir: PathBuf,
}

impl DiskSpaceProbe {
    /// Probe over the given directory.
    #[must_use]
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }
}

impl HealthProbe for DiskSpaceProbe {
    fn probe(&self) -> ProbeReport {
        if !self.data_dir.is_dir() {
            return ProbeReport::with_verdict(
                HealthVerdict::Critical,
                format!("data directory {} is missing", self.data_dir.display()),
            );
        }
        let probe_path = self.data_dir.join(".quiver-health-probe");
        match std::fs::write(&probe_path, b"ok") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe_path);
                ProbeReport::healthy("data directory writable")
                    .detail("path", self.data_dir.display().to_string())
            }
            Err(err) => ProbeReport::with_verdict(
                HealthVerdict::Critical,
                format!("data directory not writable: {err}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use quiver_core::{Message, QueueConfig};
    use tempfile::TempDir;

    use super::*;
    use crate::events::ListenerRegistry;
    use crate::persistence::{MemoryStore, MessageStore};

    fn queues() -> Arc<QueueStore> {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        store.initialize().unwrap();
        Arc::new(QueueStore::new(Some(store), Arc::new(ListenerRegistry::new())))
    }

    #[test]
    fn queue_probe_flags_full_queues() {
        let queues = queues();
        queues
            .create_queue(QueueConfig {
                max_size: 2,
                ..QueueConfig::named("q")
            })
            .unwrap();
        let probe = QueueDepthProbe::new(Arc::clone(&queues));
        assert_eq!(probe.probe().verdict, HealthVerdict::Healthy);

        queues.send_message("q", Message::text("a")).unwrap();
        queues.send_message("q", Message::text("b")).unwrap();
        let report = probe.probe();
        assert_eq!(report.verdict, HealthVerdict::Unhealthy);
        assert_eq!(report.details.get("q").map(String::as_str), Some("full"));
    }

    #[test]
    fn persistence_probe_reports_critical_when_offline() {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        let probe = PersistenceProbe::new(Arc::clone(&store));
        assert_eq!(probe.probe().verdict, HealthVerdict::Critical);

        store.initialize().unwrap();
        assert_eq!(probe.probe().verdict, HealthVerdict::Healthy);
    }

    #[test]
    fn disk_probe_checks_writability() {
        let dir = TempDir::new().unwrap();
        let probe = DiskSpaceProbe::new(dir.path().to_path_buf());
        assert_eq!(probe.probe().verdict, HealthVerdict::Healthy);

        let probe = DiskSpaceProbe::new(dir.path().join("does-not-exist"));
        assert_eq!(probe.probe().verdict, HealthVerdict::Critical);
    }

    #[test]
    fn memory_probe_reports_refusals() {
        use quiver_core::PerformanceConfig;
        let substrate = Arc::new(PerformanceSubstrate::new(PerformanceConfig {
            block_size: 64,
            memory_pool_bytes: 0,
            max_pool_bytes: 64,
            ..PerformanceConfig::default()
        }));
        let probe = MemoryPoolProbe::new(Arc::clone(&substrate));
        assert_eq!(probe.probe().verdict, HealthVerdict::Healthy);

        let held = substrate.allocate(64).unwrap();
        assert!(substrate.allocate(1).is_err());
        let report = probe.probe();
        assert_eq!(report.verdict, HealthVerdict::Unhealthy);
        substrate.deallocate(held);
    }
}
