use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{error::Fault, registry::Registry};

/// Pause after teardown so aborted tasks can drop their sockets and files.
const RECLAIM_PAUSE: Duration = Duration::from_millis(50);

/// Board-level operations the supervisor needs from the platform.
pub trait Device: Send + Sync {
    fn link_up(&self) -> bool;

    fn reconnect(&self);

    fn teardown_network(&self);

    fn feed_hardware_watchdog(&self);

    /// Arms an independent timer that resets the board after `after` unless `reset` wins first.
    fn arm_reset_fallback(&self, after: Duration);

    /// Resets the board. Real devices do not return from this.
    fn reset(&self, reason: &RestartReason);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    Fault(Fault),
    UpdateApplied { version: String },
    Requested(String),
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault(fault) => write!(f, "{fault}"),
            Self::UpdateApplied { version } => write!(f, "update to {version} applied"),
            Self::Requested(source) => write!(f, "requested by {source}"),
        }
    }
}

/// Single entry point for whole-device restarts.
pub struct RestartCoordinator {
    registry: Arc<Registry>,
    device: Arc<dyn Device>,
    grace: Duration,
    restarting: AtomicBool,
}

impl RestartCoordinator {
    pub fn new(registry: Arc<Registry>, device: Arc<dyn Device>, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            device,
            grace,
            restarting: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    /// Shuts every process down and resets the device. Only the first call does anything.
    ///
    /// The shutdown runs on its own task, so it still completes when the caller is one of
    /// the processes being cancelled.
    pub async fn restart(self: &Arc<Self>, reason: RestartReason) {
        if self.restarting.swap(true, Ordering::SeqCst) {
            info!("restart already in progress, ignoring: {reason}");
            return;
        }
        warn!("restarting device: {reason}");
        self.device.arm_reset_fallback(self.grace);

        let coordinator = self.clone();
        let shutdown = tokio::spawn(async move { coordinator.shutdown(reason).await });
        if let Err(err) = shutdown.await {
            warn!("shutdown task failed: {err}");
        }
    }

    async fn shutdown(&self, reason: RestartReason) {
        for (name, handle) in self.registry.drain() {
            handle.canceller().cancel().await;
            debug!("cancelled {name}");
        }
        self.device.teardown_network();
        tokio::time::sleep(RECLAIM_PAUSE).await;
        self.device.reset(&reason);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        process::{launcher, DispatchTable},
        testutil::{idle_launcher, settle, test_rig, DeviceEvent},
    };

    #[tokio::test(start_paused = true)]
    async fn cancels_everything_before_teardown_and_reset() {
        let (supervisor, device) = test_rig(
            DispatchTable::new()
                .with("sensor.cooling", idle_launcher())
                .with("web.server", idle_launcher()),
        );
        supervisor.launch("sensor.cooling");
        supervisor.launch("web.server");
        settle().await;

        supervisor
            .restart()
            .restart(RestartReason::Requested("test".into()))
            .await;

        assert!(supervisor.registry().is_empty());
        assert_eq!(
            device.events(),
            vec![
                DeviceEvent::FallbackArmed(Duration::from_millis(10_000)),
                DeviceEvent::Teardown,
                DeviceEvent::Reset("requested by test".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_restart_is_ignored() {
        let (supervisor, device) = test_rig(DispatchTable::new());
        let restart = supervisor.restart().clone();

        restart.restart(RestartReason::Requested("first".into())).await;
        restart.restart(RestartReason::Requested("second".into())).await;

        assert_eq!(device.reset_count(), 1);
        assert!(restart.is_restarting());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_from_inside_a_process_still_resets() {
        let (supervisor, device) = test_rig(DispatchTable::new());
        supervisor.spawn(
            "ota.worker",
            &launcher(|ctx| async move {
                ctx.supervisor()
                    .restart()
                    .restart(RestartReason::UpdateApplied {
                        version: "1.0.1".into(),
                    })
                    .await;
                Ok(())
            }),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(device.reset_count(), 1);
        assert!(supervisor.registry().is_empty());
    }
}
