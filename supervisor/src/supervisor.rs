use std::{sync::Arc, time::Duration};

use fridge_common::SupervisionConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::Fault,
    health::{self, StalenessPolicy, HEALTH_MONITOR},
    liveness::{self, LIVENESS_MONITOR},
    process::{DispatchTable, Launcher, ProcessCtx},
    registry::{ProcessHandle, Registry},
    restart::RestartCoordinator,
};

/// Owns the registry, the dispatch table and the staleness policy, and launches processes.
pub struct Supervisor {
    registry: Arc<Registry>,
    dispatch: DispatchTable,
    policy: StalenessPolicy,
    config: SupervisionConfig,
    restart: Arc<RestartCoordinator>,
}

impl Supervisor {
    /// The health monitor is added to `dispatch` when missing. The liveness monitor never is,
    /// since it is relaunched by the health monitor.
    pub fn new(
        config: SupervisionConfig,
        registry: Arc<Registry>,
        mut dispatch: DispatchTable,
        restart: Arc<RestartCoordinator>,
    ) -> Arc<Self> {
        if !dispatch.contains(HEALTH_MONITOR) {
            dispatch.insert(HEALTH_MONITOR, health::launcher());
        }
        Arc::new(Self {
            policy: StalenessPolicy::from_config(&config),
            registry,
            dispatch,
            config,
            restart,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn policy(&self) -> &StalenessPolicy {
        &self.policy
    }

    pub fn config(&self) -> &SupervisionConfig {
        &self.config
    }

    pub fn restart(&self) -> &Arc<RestartCoordinator> {
        &self.restart
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.config.health_interval_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.config.liveness_interval_ms)
    }

    /// Launches `name` from the dispatch table. Returns false for unknown names.
    pub fn launch(self: &Arc<Self>, name: &str) -> bool {
        match self.dispatch.get(name) {
            Some(launcher) => {
                self.spawn(name, &launcher);
                true
            }
            None => {
                warn!("no launcher registered for process {name}");
                false
            }
        }
    }

    /// Starts both monitors and every dispatchable process.
    pub fn launch_all(self: &Arc<Self>) {
        self.spawn(LIVENESS_MONITOR, &liveness::launcher());
        let names: Vec<String> = self.dispatch.names().map(str::to_string).collect();
        for name in names {
            self.launch(&name);
        }
    }

    /// Spawns `launcher` as process `name` and registers its handle.
    pub fn spawn(self: &Arc<Self>, name: &str, launcher: &Launcher) {
        let cancel = CancellationToken::new();
        let future = launcher(ProcessCtx::new(name, cancel.clone(), self.clone()));
        let process = name.to_string();
        let join = tokio::spawn(async move {
            match future.await {
                Ok(()) => info!("process {process} finished"),
                Err(err) => warn!(
                    "{}",
                    Fault::Crash {
                        name: process,
                        detail: format!("{err:#}"),
                    }
                ),
            }
        });
        self.registry.register(name, ProcessHandle::new(join, cancel));
        info!("process {name} launched");
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    use super::*;
    use crate::testutil::{idle_launcher, test_rig};

    #[tokio::test(start_paused = true)]
    async fn monitors_together_replace_a_silent_process() {
        let (supervisor, device) =
            test_rig(DispatchTable::new().with("sensor.cooling", idle_launcher()));
        let start = Instant::now();
        supervisor.launch_all();
        let registry = supervisor.registry();
        assert_eq!(registry.running_count(), (3, 3));

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(registry.started_at("sensor.cooling"), Some(start));
        assert_eq!(registry.restarted_count(), 0);

        // Cancelled by the health sweep at 130s, collected by the liveness sweep at 135s.
        tokio::time::sleep(Duration::from_secs(15)).await;
        let relaunched = registry
            .started_at("sensor.cooling")
            .expect("sensor.cooling relaunched");
        assert!(relaunched >= start + Duration::from_secs(130));
        assert_eq!(registry.restarted_count(), 1);
        assert_eq!(registry.running_count(), (3, 3));
        assert!(registry.contains(HEALTH_MONITOR));
        assert!(registry.contains(LIVENESS_MONITOR));
        assert_eq!(device.reset_count(), 0);
    }
}
