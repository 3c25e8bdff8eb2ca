use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::time::{Instant, MissedTickBehavior};
use tracing::error;

use crate::{
    error::Fault,
    restart::{Device, RestartCoordinator, RestartReason},
};

/// Software watchdog fed by the top-level loop, backed by the board's hardware timer.
pub struct WatchdogBridge {
    last_fed: Mutex<Instant>,
    timeout: Duration,
    device: Arc<dyn Device>,
    tripped: AtomicBool,
}

impl WatchdogBridge {
    pub fn new(timeout: Duration, device: Arc<dyn Device>) -> Self {
        Self {
            last_fed: Mutex::new(Instant::now()),
            timeout,
            device,
            tripped: AtomicBool::new(false),
        }
    }

    /// Called from the supervisory loop only. Stops reaching the hardware timer once tripped.
    pub fn feed(&self) {
        *self.last_fed.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        if !self.is_tripped() {
            self.device.feed_hardware_watchdog();
        }
    }

    pub fn last_fed(&self) -> Instant {
        *self.last_fed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_fed()) > self.timeout
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Checks every `interval` and restarts the device once the loop has gone quiet.
    pub async fn monitor(&self, interval: Duration, restart: &Arc<RestartCoordinator>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            if !self.is_overdue(now) {
                continue;
            }
            // From here on only the hardware timer or the coordinator can reset the board.
            self.tripped.store(true, Ordering::SeqCst);
            let silent_ms = now.saturating_duration_since(self.last_fed()).as_millis() as u64;
            let fault = Fault::WatchdogTimeout(silent_ms);
            error!("{fault}");
            restart.restart(RestartReason::Fault(fault)).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        process::{launcher, DispatchTable},
        testutil::{test_rig, DeviceEvent},
    };

    #[tokio::test(start_paused = true)]
    async fn restarts_on_first_sweep_past_timeout() {
        let (supervisor, device) = test_rig(DispatchTable::new());
        let start = Instant::now();
        let bridge = Arc::new(WatchdogBridge::new(
            Duration::from_secs(30),
            device.clone(),
        ));

        let restart = supervisor.restart().clone();
        let watchdog = bridge.clone();
        tokio::spawn(async move {
            watchdog.monitor(Duration::from_secs(5), &restart).await;
        });

        tokio::time::sleep(Duration::from_secs(34)).await;
        assert_eq!(device.reset_count(), 0);
        assert!(!bridge.is_tripped());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(device.reset_count(), 1);
        assert_eq!(device.fallback_armed_at(), Some(start + Duration::from_secs(35)));
    }

    #[tokio::test(start_paused = true)]
    async fn regular_feeding_prevents_restart() {
        let (supervisor, device) = test_rig(DispatchTable::new());
        let bridge = Arc::new(WatchdogBridge::new(
            Duration::from_secs(30),
            device.clone(),
        ));

        let restart = supervisor.restart().clone();
        let watchdog = bridge.clone();
        tokio::spawn(async move {
            watchdog.monitor(Duration::from_secs(5), &restart).await;
        });

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            bridge.feed();
        }
        assert_eq!(device.reset_count(), 0);
        assert_eq!(device.hardware_feeds(), 20);
    }

    /// Runs on the real clock: a blocked executor never lets paused time advance.
    #[tokio::test]
    async fn process_that_never_yields_starves_hardware_feeds() {
        let (supervisor, device) = test_rig(DispatchTable::new());
        let bridge = Arc::new(WatchdogBridge::new(
            Duration::from_millis(200),
            device.clone(),
        ));

        let main_loop = bridge.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(10));
            loop {
                ticker.tick().await;
                main_loop.feed();
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(device.hardware_feeds() > 0);

        let observed = Arc::new(Mutex::new(None));
        let report = observed.clone();
        let watchdog = bridge.clone();
        let board = device.clone();
        supervisor.spawn(
            "sensor.cooling",
            &launcher(move |_ctx| {
                let report = report.clone();
                let watchdog = watchdog.clone();
                let board = board.clone();
                async move {
                    let before = board.hardware_feeds();
                    // Holds the executor thread without reaching an await point.
                    std::thread::sleep(Duration::from_millis(300));
                    let after = board.hardware_feeds();
                    let overdue = watchdog.is_overdue(Instant::now());
                    *report.lock().unwrap() = Some((before, after, overdue));
                    Ok(())
                }
            }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (before, after, overdue) = observed
            .lock()
            .unwrap()
            .take()
            .expect("blocking process ran");
        assert_eq!(after, before);
        assert!(overdue);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(device.hardware_feeds() > after);
    }

    #[tokio::test(start_paused = true)]
    async fn tripped_bridge_stops_feeding_hardware() {
        let (supervisor, device) = test_rig(DispatchTable::new());
        let bridge = WatchdogBridge::new(Duration::from_secs(30), device.clone());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(bridge.is_overdue(Instant::now()));
        bridge
            .monitor(Duration::from_secs(5), supervisor.restart())
            .await;

        bridge.feed();
        assert!(bridge.is_tripped());
        assert_eq!(device.hardware_feeds(), 0);
        assert!(device
            .events()
            .iter()
            .any(|event| matches!(event, DeviceEvent::Reset(_))));
    }
}
