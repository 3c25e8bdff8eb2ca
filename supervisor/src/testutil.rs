use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use fridge_common::SupervisionConfig;
use tokio::time::Instant;

use crate::{
    process::{launcher, DispatchTable, Launcher},
    registry::Registry,
    restart::{Device, RestartCoordinator, RestartReason},
    supervisor::Supervisor,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeviceEvent {
    Reconnect,
    Teardown,
    FallbackArmed(Duration),
    Reset(String),
}

#[derive(Default)]
pub(crate) struct RecordingDevice {
    events: Mutex<Vec<DeviceEvent>>,
    hardware_feeds: Mutex<usize>,
    fallback_at: Mutex<Option<Instant>>,
}

impl RecordingDevice {
    pub(crate) fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn reset_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, DeviceEvent::Reset(_)))
            .count()
    }

    pub(crate) fn hardware_feeds(&self) -> usize {
        *self.hardware_feeds.lock().unwrap()
    }

    pub(crate) fn fallback_armed_at(&self) -> Option<Instant> {
        *self.fallback_at.lock().unwrap()
    }
}

impl Device for RecordingDevice {
    fn link_up(&self) -> bool {
        true
    }

    fn reconnect(&self) {
        self.events.lock().unwrap().push(DeviceEvent::Reconnect);
    }

    fn teardown_network(&self) {
        self.events.lock().unwrap().push(DeviceEvent::Teardown);
    }

    fn feed_hardware_watchdog(&self) {
        *self.hardware_feeds.lock().unwrap() += 1;
    }

    fn arm_reset_fallback(&self, after: Duration) {
        *self.fallback_at.lock().unwrap() = Some(Instant::now());
        self.events
            .lock()
            .unwrap()
            .push(DeviceEvent::FallbackArmed(after));
    }

    fn reset(&self, reason: &RestartReason) {
        self.events
            .lock()
            .unwrap()
            .push(DeviceEvent::Reset(reason.to_string()));
    }
}

pub(crate) fn test_coordinator() -> (Arc<RestartCoordinator>, Arc<RecordingDevice>) {
    let device = Arc::new(RecordingDevice::default());
    let coordinator = RestartCoordinator::new(
        Arc::new(Registry::new()),
        device.clone(),
        Duration::from_millis(SupervisionConfig::default().restart_grace_ms),
    );
    (coordinator, device)
}

pub(crate) fn test_rig(dispatch: DispatchTable) -> (Arc<Supervisor>, Arc<RecordingDevice>) {
    let config = SupervisionConfig::default();
    let registry = Arc::new(Registry::new());
    let device = Arc::new(RecordingDevice::default());
    let coordinator = RestartCoordinator::new(
        registry.clone(),
        device.clone(),
        Duration::from_millis(config.restart_grace_ms),
    );
    (Supervisor::new(config, registry, dispatch, coordinator), device)
}

pub(crate) fn test_supervisor(dispatch: DispatchTable) -> Arc<Supervisor> {
    test_rig(dispatch).0
}

/// Runs until cancelled, never feeding its health.
pub(crate) fn idle_launcher() -> Launcher {
    launcher(|ctx| async move {
        ctx.cancelled().await;
        Ok(())
    })
}

pub(crate) fn one_shot_launcher() -> Launcher {
    launcher(|_ctx| async { Ok(()) })
}

pub(crate) fn failing_launcher() -> Launcher {
    launcher(|_ctx| async { Err(anyhow::anyhow!("probe bus stuck")) })
}

/// Lets spawned tasks run up to their next real suspension point.
pub(crate) async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
