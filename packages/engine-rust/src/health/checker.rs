//! The checker: registration, the periodic runner thread, threshold
//! smoothing, and aggregate computation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use quiver_core::types::now_millis;
use tracing::{debug, warn};

use super::{
    HealthCheckConfig, HealthCheckKind, HealthCheckStatus, HealthProbe, HealthVerdict,
    OverallHealth, ProbeReport,
};
use crate::worker::Worker;

/// Callback fired after every completed check.
pub type StatusCallback = Arc<dyn Fn(HealthCheckKind, &HealthCheckStatus) + Send + Sync>;
/// Callback fired when the aggregate verdict changes.
pub type OverallCallback = Arc<dyn Fn(&OverallHealth) + Send + Sync>;

struct CheckEntry {
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    status: HealthCheckStatus,
    next_due_ms: u64,
}

#[derive(Default)]
struct Callbacks {
    status: Option<StatusCallback>,
    overall: Option<OverallCallback>,
}

/// Periodic health checker. One runner thread serves every registered
/// check; the aggregate lives behind an [`ArcSwap`] so readers never
/// block the runner.
pub struct HealthChecker {
    checks: RwLock<AHashMap<HealthCheckKind, CheckEntry>>,
    overall: ArcSwap<OverallHealth>,
    callbacks: RwLock<Callbacks>,
    runner: Mutex<Option<Worker>>,
}

impl HealthChecker {
    /// Runner tick; individual checks run at their own intervals on top.
    const TICK: Duration = Duration::from_millis(1_000);

    /// An empty checker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            checks: RwLock::new(AHashMap::new()),
            overall: ArcSwap::from_pointee(OverallHealth::default()),
            callbacks: RwLock::new(Callbacks::default()),
            runner: Mutex::new(None),
        }
    }

    /// Registers (or replaces) the check for a kind.
    pub fn register(&self, config: HealthCheckConfig, probe: Arc<dyn HealthProbe>) {
        let kind = config.kind;
        self.checks.write().insert(
            kind,
            CheckEntry {
                config,
                probe,
                status: HealthCheckStatus::default(),
                next_due_ms: 0,
            },
        );
        debug!(kind = kind.as_str(), "health check registered");
    }

    /// Removes the check for a kind. Returns whether one was registered.
    pub fn unregister(&self, kind: HealthCheckKind) -> bool {
        self.checks.write().remove(&kind).is_some()
    }

    /// Whether a check is registered for the kind.
    #[must_use]
    pub fn is_registered(&self, kind: HealthCheckKind) -> bool {
        self.checks.read().contains_key(&kind)
    }

    /// Sets the per-check callback.
    pub fn set_status_callback(&self, callback: StatusCallback) {
        self.callbacks.write().status = Some(callback);
    }

    /// Sets the aggregate-change callback.
    pub fn set_overall_callback(&self, callback: OverallCallback) {
        self.callbacks.write().overall = Some(callback);
    }

    /// Clears both callbacks.
    pub fn remove_callbacks(&self) {
        let mut callbacks = self.callbacks.write();
        callbacks.status = None;
        callbacks.overall = None;
    }

    /// Starts the runner thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut runner = self.runner.lock();
        if runner.is_some() {
            return;
        }
        let checker = Arc::clone(self);
        *runner = Some(Worker::spawn("quiver-health", move |signal| {
            while !signal.wait(Self::TICK) {
                checker.run_due_checks(now_millis());
            }
        }));
    }

    /// Stops the runner thread.
    pub fn stop(&self) {
        if let Some(mut worker) = self.runner.lock().take() {
            worker.shutdown();
        }
    }

    /// Runs one check immediately, regardless of its schedule.
    pub fn perform_check(&self, kind: HealthCheckKind) -> Option<HealthCheckStatus> {
        let result = self.run_one(kind, now_millis());
        if result.is_some() {
            self.refresh_overall();
        }
        result
    }

    /// Runs every enabled check immediately and returns the aggregate.
    pub fn perform_all_checks(&self) -> OverallHealth {
        let kinds: Vec<HealthCheckKind> = self.checks.read().keys().copied().collect();
        let now = now_millis();
        for kind in kinds {
            self.run_one(kind, now);
        }
        self.refresh_overall()
    }

    /// Latest published status for a check.
    #[must_use]
    pub fn status(&self, kind: HealthCheckKind) -> Option<HealthCheckStatus> {
        self.checks.read().get(&kind).map(|entry| entry.status.clone())
    }

    /// The current aggregate.
    #[must_use]
    pub fn overall(&self) -> OverallHealth {
        OverallHealth::clone(&self.overall.load())
    }

    /// Whether the aggregate is healthy or merely degraded.
    #[must_use]
    pub fn is_overall_healthy(&self) -> bool {
        matches!(
            self.overall.load().verdict,
            HealthVerdict::Healthy | HealthVerdict::Degraded
        )
    }

    /// Runs checks whose interval has elapsed. Called by the runner;
    /// `now_ms` is injectable for tests.
    pub fn run_due_checks(&self, now_ms: u64) {
        let due: Vec<HealthCheckKind> = self
            .checks
            .read()
            .iter()
            .filter(|(_, entry)| entry.config.enabled && entry.next_due_ms <= now_ms)
            .map(|(&kind, _)| kind)
            .collect();
        if due.is_empty() {
            return;
        }
        for kind in due {
            self.run_one(kind, now_ms);
        }
        self.refresh_overall();
    }

    /// Runs one check and folds the observation into its status.
    fn run_one(&self, kind: HealthCheckKind, now_ms: u64) -> Option<HealthCheckStatus> {
        // Clone the probe handle out so the probe itself runs without the
        // table lock held.
        let probe = {
            let checks = self.checks.read();
            let entry = checks.get(&kind)?;
            if !entry.config.enabled {
                return Some(entry.status.clone());
            }
            Arc::clone(&entry.probe)
        };

        let started = Instant::now();
        let report = probe.probe();
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut checks = self.checks.write();
        let entry = checks.get_mut(&kind)?;
        entry.next_due_ms = now_ms + entry.config.interval_ms;
        let status = Self::fold(&entry.config, &mut entry.status, report, now_ms, elapsed_ms);
        let snapshot = status.clone();
        drop(checks);

        if snapshot.verdict.is_failure() {
            warn!(kind = kind.as_str(), verdict = snapshot.verdict.as_str(),
                  message = %snapshot.message, "health check failing");
        }
        if let Some(callback) = self.callbacks.read().status.clone() {
            callback(kind, &snapshot);
        }
        Some(snapshot)
    }

    /// Applies threshold smoothing: a failing observation publishes as
    /// unhealthy only after `unhealthy_threshold` consecutive failures,
    /// and recovery publishes only after `healthy_threshold` consecutive
    /// successes. Degraded and critical observations publish immediately.
    fn fold(
        config: &HealthCheckConfig,
        status: &mut HealthCheckStatus,
        report: ProbeReport,
        now_ms: u64,
        elapsed_ms: u64,
    ) -> HealthCheckStatus {
        status.total_checks += 1;
        status.last_check_ms = now_ms;
        status.response_time_ms = elapsed_ms;
        status.message = report.message;
        status.details = report.details;

        if report.verdict.is_failure() {
            status.total_failures += 1;
            status.consecutive_failures += 1;
            status.consecutive_successes = 0;
            status.last_failure_ms = now_ms;
            if report.verdict == HealthVerdict::Critical
                || status.consecutive_failures >= config.unhealthy_threshold
            {
                status.verdict = report.verdict;
            }
        } else {
            status.consecutive_successes += 1;
            status.consecutive_failures = 0;
            status.last_success_ms = now_ms;
            let recovering = status.verdict.is_failure();
            if !recovering || status.consecutive_successes >= config.healthy_threshold {
                status.verdict = report.verdict;
            }
        }
        status.clone()
    }

    /// Recomputes the aggregate; fires the overall callback on change.
    fn refresh_overall(&self) -> OverallHealth {
        let checks = self.checks.read();
        let mut overall = OverallHealth {
            last_update_ms: now_millis(),
            total_checks: checks.len(),
            ..OverallHealth::default()
        };
        for (kind, entry) in checks.iter() {
            match entry.status.verdict {
                HealthVerdict::Healthy => overall.healthy_checks += 1,
                HealthVerdict::Degraded => overall.degraded_checks += 1,
                HealthVerdict::Unhealthy => overall.unhealthy_checks += 1,
                HealthVerdict::Critical => overall.critical_checks += 1,
                HealthVerdict::Unknown => {}
            }
            if entry.status.verdict.is_failure()
                || entry.status.verdict == HealthVerdict::Degraded
            {
                overall
                    .issues
                    .push(format!("{}: {}", kind.as_str(), entry.status.message));
            }
        }
        drop(checks);

        overall.verdict = if overall.critical_checks > 0 {
            HealthVerdict::Critical
        } else if overall.unhealthy_checks > 0 {
            HealthVerdict::Unhealthy
        } else if overall.degraded_checks > 0 {
            HealthVerdict::Degraded
        } else if overall.healthy_checks > 0 {
            HealthVerdict::Healthy
        } else {
            HealthVerdict::Unknown
        };
        overall.message = match overall.verdict {
            HealthVerdict::Healthy => "all checks healthy".into(),
            HealthVerdict::Unknown => "no observations yet".into(),
            _ => overall.issues.join("; "),
        };

        let changed = self.overall.load().verdict != overall.verdict;
        self.overall.store(Arc::new(overall.clone()));
        if changed {
            if let Some(callback) = self.callbacks.read().overall.clone() {
                callback(&overall);
            }
        }
        overall
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct ScriptedProbe {
        verdicts: Mutex<Vec<HealthVerdict>>,
    }

    impl ScriptedProbe {
        fn new(verdicts: Vec<HealthVerdict>) -> Arc<Self> {
            Arc::new(Self {
                verdicts: Mutex::new(verdicts),
            })
        }
    }

    impl HealthProbe for ScriptedProbe {
        fn probe(&self) -> ProbeReport {
            let mut verdicts = self.verdicts.lock();
            let verdict = if verdicts.is_empty() {
                HealthVerdict::Healthy
            } else {
                verdicts.remove(0)
            };
            ProbeReport::with_verdict(verdict, format!("scripted {}", verdict.as_str()))
        }
    }

    fn config(kind: HealthCheckKind) -> HealthCheckConfig {
        HealthCheckConfig {
            unhealthy_threshold: 2,
            healthy_threshold: 2,
            ..HealthCheckConfig::new(kind)
        }
    }

    #[test]
    fn unhealthy_requires_consecutive_failures() {
        let checker = HealthChecker::new();
        checker.register(
            config(HealthCheckKind::Custom),
            ScriptedProbe::new(vec![HealthVerdict::Unhealthy, HealthVerdict::Unhealthy]),
        );

        let status = checker.perform_check(HealthCheckKind::Custom).unwrap();
        // One failure: not yet published.
        assert_eq!(status.verdict, HealthVerdict::Unknown);
        assert_eq!(status.consecutive_failures, 1);

        let status = checker.perform_check(HealthCheckKind::Custom).unwrap();
        assert_eq!(status.verdict, HealthVerdict::Unhealthy);
    }

    #[test]
    fn critical_publishes_immediately() {
        let checker = HealthChecker::new();
        checker.register(
            config(HealthCheckKind::Disk),
            ScriptedProbe::new(vec![HealthVerdict::Critical]),
        );
        let status = checker.perform_check(HealthCheckKind::Disk).unwrap();
        assert_eq!(status.verdict, HealthVerdict::Critical);
        assert_eq!(checker.overall().verdict, HealthVerdict::Critical);
    }

    #[test]
    fn recovery_requires_consecutive_successes() {
        let checker = HealthChecker::new();
        checker.register(
            config(HealthCheckKind::Custom),
            ScriptedProbe::new(vec![
                HealthVerdict::Unhealthy,
                HealthVerdict::Unhealthy,
                HealthVerdict::Healthy,
                HealthVerdict::Healthy,
            ]),
        );
        checker.perform_check(HealthCheckKind::Custom);
        checker.perform_check(HealthCheckKind::Custom);
        let status = checker.perform_check(HealthCheckKind::Custom).unwrap();
        // One success after failing: still unhealthy.
        assert_eq!(status.verdict, HealthVerdict::Unhealthy);
        let status = checker.perform_check(HealthCheckKind::Custom).unwrap();
        assert_eq!(status.verdict, HealthVerdict::Healthy);
    }

    #[test]
    fn aggregate_precedence() {
        let checker = HealthChecker::new();
        checker.register(
            config(HealthCheckKind::Queue),
            ScriptedProbe::new(vec![HealthVerdict::Healthy]),
        );
        checker.register(
            config(HealthCheckKind::Memory),
            ScriptedProbe::new(vec![HealthVerdict::Degraded]),
        );
        let overall = checker.perform_all_checks();
        assert_eq!(overall.verdict, HealthVerdict::Degraded);
        assert_eq!(overall.healthy_checks, 1);
        assert_eq!(overall.degraded_checks, 1);
        assert_eq!(overall.issues.len(), 1);
    }

    #[test]
    fn empty_checker_is_unknown() {
        let checker = HealthChecker::new();
        assert_eq!(checker.perform_all_checks().verdict, HealthVerdict::Unknown);
    }

    #[test]
    fn overall_callback_fires_on_change_only() {
        let checker = HealthChecker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        checker.set_overall_callback(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        checker.register(
            config(HealthCheckKind::Custom),
            ScriptedProbe::new(vec![
                HealthVerdict::Healthy,
                HealthVerdict::Healthy,
                HealthVerdict::Critical,
            ]),
        );
        checker.perform_check(HealthCheckKind::Custom); // Unknown -> Healthy
        checker.perform_check(HealthCheckKind::Custom); // no change
        checker.perform_check(HealthCheckKind::Custom); // Healthy -> Critical
        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn unregister_removes_check() {
        let checker = HealthChecker::new();
        checker.register(
            config(HealthCheckKind::Custom),
            ScriptedProbe::new(vec![]),
        );
        assert!(checker.is_registered(HealthCheckKind::Custom));
        assert!(checker.unregister(HealthCheckKind::Custom));
        assert!(!checker.is_registered(HealthCheckKind::Custom));
        assert!(checker.perform_check(HealthCheckKind::Custom).is_none());
    }

    #[test]
    fn due_scheduling_respects_intervals() {
        let checker = HealthChecker::new();
        checker.register(
            HealthCheckConfig::new(HealthCheckKind::Custom).every_ms(1_000),
            ScriptedProbe::new(vec![]),
        );
        let base = now_millis();
        checker.run_due_checks(base);
        let first = checker.status(HealthCheckKind::Custom).unwrap();
        assert_eq!(first.total_checks, 1);

        // Not due yet.
        checker.run_due_checks(base + 500);
        assert_eq!(checker.status(HealthCheckKind::Custom).unwrap().total_checks, 1);

        checker.run_due_checks(base + 1_500);
        assert_eq!(checker.status(HealthCheckKind::Custom).unwrap().total_checks, 2);
    }
}
