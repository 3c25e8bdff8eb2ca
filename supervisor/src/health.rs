use std::{collections::HashMap, sync::Arc, time::Duration};

use fridge_common::SupervisionConfig;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::{
    error::Fault,
    liveness::{self, LIVENESS_MONITOR},
    process::{self, Launcher, ProcessCtx},
    registry::ProcessStatus,
    supervisor::Supervisor,
};

pub const HEALTH_MONITOR: &str = "health.monitor";

/// Per-process staleness thresholds with a shared default.
#[derive(Debug, Clone)]
pub struct StalenessPolicy {
    default: Duration,
    overrides: HashMap<String, Duration>,
}

impl StalenessPolicy {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn from_config(config: &SupervisionConfig) -> Self {
        let mut policy = Self::new(Duration::from_millis(config.default_stale_ms));
        for (name, ms) in &config.stale_overrides_ms {
            policy = policy.with_override(name.clone(), Duration::from_millis(*ms));
        }
        policy
    }

    pub fn with_override(mut self, name: impl Into<String>, threshold: Duration) -> Self {
        self.overrides.insert(name.into(), threshold);
        self
    }

    pub fn threshold_for(&self, name: &str) -> Duration {
        self.overrides.get(name).copied().unwrap_or(self.default)
    }

    /// A process whose silence equals the threshold exactly is still healthy.
    pub fn is_stale(&self, name: &str, silent_for: Duration) -> bool {
        silent_for > self.threshold_for(name)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthSweep {
    pub cancelled: Vec<String>,
    pub relaunched_liveness: bool,
}

/// One staleness pass over the registry as of `now`.
pub async fn sweep(supervisor: &Arc<Supervisor>, now: Instant) -> HealthSweep {
    let registry = supervisor.registry();
    let policy = supervisor.policy();
    let mut report = HealthSweep::default();

    for process in registry.snapshot() {
        if process.name == HEALTH_MONITOR {
            continue;
        }
        let silent_for = now.saturating_duration_since(process.last_health);
        let stale = policy.is_stale(&process.name, silent_for);
        let finished = process.status == ProcessStatus::Finished;

        if process.name == LIVENESS_MONITOR {
            if stale || finished {
                warn!("liveness monitor unresponsive, relaunching it");
                if let Some(handle) = registry.remove(LIVENESS_MONITOR) {
                    handle.canceller().cancel().await;
                }
                supervisor.spawn(LIVENESS_MONITOR, &liveness::launcher());
                report.relaunched_liveness = true;
            }
            continue;
        }

        // Finished processes are the liveness monitor's to collect.
        if !stale || finished {
            continue;
        }
        warn!(
            "{}",
            Fault::Staleness {
                name: process.name.clone(),
                age_ms: silent_for.as_millis() as u64,
                threshold_ms: policy.threshold_for(&process.name).as_millis() as u64,
            }
        );
        registry.cancel(&process.name).await;
        report.cancelled.push(process.name);
    }

    registry.feed_health(HEALTH_MONITOR);
    debug!("health sweep done, {} cancelled", report.cancelled.len());
    report
}

pub async fn run(ctx: ProcessCtx) -> anyhow::Result<()> {
    let supervisor = ctx.supervisor().clone();
    let mut ticker = tokio::time::interval(supervisor.health_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        sweep(&supervisor, Instant::now()).await;
    }
}

pub fn launcher() -> Launcher {
    process::launcher(run)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        process::DispatchTable,
        testutil::{idle_launcher, settle, test_supervisor},
    };

    #[test]
    fn staleness_boundary_is_exclusive() {
        let policy = StalenessPolicy::new(Duration::from_secs(120));
        assert!(!policy.is_stale("sensor.cooling", Duration::from_secs(120)));
        assert!(policy.is_stale(
            "sensor.cooling",
            Duration::from_secs(120) + Duration::from_millis(1)
        ));
    }

    #[test]
    fn overrides_replace_default_threshold() {
        let policy = StalenessPolicy::new(Duration::from_secs(120))
            .with_override("time.sync", Duration::from_secs(86_520));
        assert_eq!(policy.threshold_for("time.sync"), Duration::from_secs(86_520));
        assert_eq!(policy.threshold_for("web.server"), Duration::from_secs(120));
        assert!(!policy.is_stale("time.sync", Duration::from_secs(3_600)));
    }

    #[test]
    fn policy_reads_config_overrides() {
        let mut config = SupervisionConfig::default();
        config.stale_overrides_ms.insert("ota.worker".into(), 500_000);
        let policy = StalenessPolicy::from_config(&config);
        assert_eq!(policy.threshold_for("ota.worker"), Duration::from_millis(500_000));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_process_is_cancelled_but_not_relaunched() {
        let supervisor = test_supervisor(DispatchTable::new().with("web.server", idle_launcher()));
        supervisor.launch("web.server");
        let started = supervisor.registry().started_at("web.server").unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(sweep(&supervisor, Instant::now()).await, HealthSweep::default());

        tokio::time::advance(Duration::from_millis(1)).await;
        let report = sweep(&supervisor, Instant::now()).await;
        settle().await;

        assert_eq!(report.cancelled, vec!["web.server".to_string()]);
        assert_eq!(supervisor.registry().running_count(), (0, 1));
        assert_eq!(supervisor.registry().started_at("web.server"), Some(started));
    }

    #[tokio::test(start_paused = true)]
    async fn fed_process_stays_alive() {
        let supervisor = test_supervisor(DispatchTable::new().with("web.server", idle_launcher()));
        supervisor.launch("web.server");

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(100)).await;
            supervisor.registry().feed_health("web.server");
            let report = sweep(&supervisor, Instant::now()).await;
            assert!(report.cancelled.is_empty());
        }
        assert_eq!(supervisor.registry().running_count(), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_liveness_monitor_is_replaced() {
        let supervisor = test_supervisor(DispatchTable::new());
        supervisor.spawn(LIVENESS_MONITOR, &idle_launcher());

        tokio::time::advance(Duration::from_secs(121)).await;
        let now = Instant::now();
        let report = sweep(&supervisor, now).await;

        assert!(report.relaunched_liveness);
        let registry = supervisor.registry();
        assert!(registry.started_at(LIVENESS_MONITOR).unwrap() >= now);
        assert_eq!(registry.running_count(), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn feeds_itself_after_every_sweep() {
        let supervisor = test_supervisor(DispatchTable::new());
        supervisor.spawn(HEALTH_MONITOR, &idle_launcher());

        tokio::time::advance(Duration::from_secs(50)).await;
        let now = Instant::now();
        sweep(&supervisor, now).await;

        assert_eq!(supervisor.registry().last_health(HEALTH_MONITOR), Some(now));
    }
}
