use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::{
    error::Fault,
    process::{self, Launcher, ProcessCtx},
    supervisor::Supervisor,
};

pub const LIVENESS_MONITOR: &str = "liveness.monitor";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessSweep {
    pub relaunched: Vec<String>,
    pub dropped: Vec<String>,
}

/// Collects finished processes and relaunches the dispatchable ones under the same name.
pub async fn sweep(supervisor: &Arc<Supervisor>) -> LivenessSweep {
    let registry = supervisor.registry();
    let mut report = LivenessSweep::default();

    for name in registry.finished_names() {
        if name == LIVENESS_MONITOR {
            continue;
        }
        let Some(handle) = registry.remove(&name) else {
            continue;
        };
        match handle.into_join().await {
            Ok(()) => info!("process {name} completed"),
            Err(err) if err.is_panic() => warn!(
                "{}",
                Fault::Crash {
                    name: name.clone(),
                    detail: "panicked".to_string(),
                }
            ),
            Err(_) => info!("process {name} was cancelled"),
        }

        match supervisor.dispatch().get(&name) {
            Some(launcher) => {
                supervisor.spawn(&name, &launcher);
                let restarts = registry.note_restart();
                info!("process {name} relaunched ({restarts} restarts so far)");
                report.relaunched.push(name);
            }
            None => {
                info!("process {name} has no launcher, dropping it");
                report.dropped.push(name);
            }
        }
    }

    registry.feed_health(LIVENESS_MONITOR);
    report
}

pub async fn run(ctx: ProcessCtx) -> anyhow::Result<()> {
    let supervisor = ctx.supervisor().clone();
    let mut ticker = tokio::time::interval(supervisor.liveness_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        sweep(&supervisor).await;
    }
}

pub fn launcher() -> Launcher {
    process::launcher(run)
}
