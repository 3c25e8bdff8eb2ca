use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use fridge_common::{
    ControllerStatePayload, CoolingEngine, PowerReading, RuntimeConfig, TemperatureHistory,
};
use fridge_supervisor::{
    ota::{
        read_local_version, run_boot_check, BootOutcome, ImageValidator, UpdateLayout,
        UpdateManager,
    },
    Device, Registry, RestartCoordinator, Supervisor, WatchdogBridge,
};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::{board::Board, processes};

#[cfg(not(feature = "esp32"))]
pub type Remote = fridge_supervisor::ota::GithubRawSource;
#[cfg(feature = "esp32")]
pub type Remote = crate::esp::EspHttpSource;

pub type Updater = UpdateManager<Remote, ImageValidator>;

/// Everything a platform hands to the shared runtime.
pub struct Platform {
    pub board: Arc<dyn Board>,
    pub device: Arc<dyn Device>,
    pub data_dir: PathBuf,
    pub config: RuntimeConfig,
    pub remote: Option<Remote>,
}

/// State shared by the device processes and the web surface.
pub struct AppState {
    pub config: RuntimeConfig,
    pub board: Arc<dyn Board>,
    pub device: Arc<dyn Device>,
    pub cooling: Mutex<CoolingEngine>,
    pub history: Mutex<TemperatureHistory>,
    pub power: Mutex<Option<PowerReading>>,
    pub updater: Option<Arc<Updater>>,
    pub ota_requests: Notify,
    pub boost_requested: AtomicBool,
    pub boot_outcome: BootOutcome,
    pub version: Option<String>,
    last_time_sync: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeStatus {
    pub synced: bool,
    #[serde(rename = "lastSyncEpoch")]
    pub last_sync_epoch: Option<i64>,
    pub timezone: String,
    #[serde(rename = "localTime")]
    pub local_time: Option<String>,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        board: Arc<dyn Board>,
        device: Arc<dyn Device>,
        updater: Option<Arc<Updater>>,
        boot_outcome: BootOutcome,
        version: Option<String>,
    ) -> Self {
        Self {
            cooling: Mutex::new(CoolingEngine::new(config.cooling.clone())),
            history: Mutex::new(TemperatureHistory::new()),
            power: Mutex::new(None),
            ota_requests: Notify::new(),
            boost_requested: AtomicBool::new(false),
            last_time_sync: AtomicI64::new(0),
            config,
            board,
            device,
            updater,
            boot_outcome,
            version,
        }
    }

    pub fn note_time_sync(&self, epoch: i64) {
        self.last_time_sync.store(epoch, Ordering::Relaxed);
    }

    pub fn last_time_sync(&self) -> Option<i64> {
        match self.last_time_sync.load(Ordering::Relaxed) {
            0 => None,
            epoch => Some(epoch),
        }
    }

    /// Wall-clock time in the configured zone, once the clock has been synced.
    pub fn local_time(&self) -> Option<NaiveDateTime> {
        self.last_time_sync()?;
        let tz: Tz = self.config.timezone.parse().ok()?;
        Some(Utc::now().with_timezone(&tz).naive_local())
    }

    pub fn time_status(&self) -> TimeStatus {
        TimeStatus {
            synced: self.last_time_sync().is_some(),
            last_sync_epoch: self.last_time_sync(),
            timezone: self.config.timezone.clone(),
            local_time: self
                .local_time()
                .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }

    pub fn take_boost_request(&self) -> bool {
        self.boost_requested.swap(false, Ordering::Relaxed)
    }

    pub async fn state_payload(&self, supervisor: &Supervisor) -> ControllerStatePayload {
        let cooling = self.cooling.lock().await.status();
        let history = self.history.lock().await.status();
        let power = *self.power.lock().await;
        let registry = supervisor.registry();
        let (tasks_running, tasks_total) = registry.running_count();

        ControllerStatePayload {
            temp: cooling.temperature_c,
            stage: cooling.stage,
            alarm: cooling.alarm,
            min_24h: history.min_c,
            max_24h: history.max_c,
            power,
            tasks_running,
            tasks_total,
            restarted_count: registry.restarted_count(),
            uptime_secs: monotonic_ms() / 1_000,
            version: self.version.clone(),
        }
    }
}

/// Boots the device and runs the supervisory loop until a restart takes the process down.
pub async fn run(platform: Platform) -> anyhow::Result<()> {
    monotonic_ms();
    let Platform {
        board,
        device,
        data_dir,
        mut config,
        remote,
    } = platform;
    prepare_config(&mut config);

    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    let layout = UpdateLayout::new(&data_dir, &config.ota.live_file, &config.ota.version_file);

    let supervision = &config.supervision;
    let registry = Arc::new(Registry::new());
    let coordinator = RestartCoordinator::new(
        registry.clone(),
        device.clone(),
        Duration::from_millis(supervision.restart_grace_ms),
    );

    let boot_outcome = run_boot_check(&layout, &ImageValidator, &coordinator)
        .await
        .context("boot integrity check failed")?;
    info!("boot integrity check: {boot_outcome:?}");
    if boot_outcome.requires_restart() {
        return Ok(());
    }

    let version = read_local_version(&layout.version)
        .await
        .map(|version| version.to_string());
    let updater = remote.map(|remote| {
        let manager =
            UpdateManager::new(remote, ImageValidator, layout.clone(), coordinator.clone())
                .with_remote_paths(&config.ota.app_path, &config.ota.version_path);
        manager.record_boot(&boot_outcome);
        Arc::new(manager)
    });
    if updater.is_none() {
        info!("ota disabled, no update source configured");
    }

    let app = Arc::new(AppState::new(
        config.clone(),
        board,
        device.clone(),
        updater,
        boot_outcome,
        version,
    ));
    let supervisor = Supervisor::new(
        config.supervision.clone(),
        registry,
        processes::dispatch_table(&app),
        coordinator.clone(),
    );
    supervisor.launch_all();

    let bridge = Arc::new(WatchdogBridge::new(
        Duration::from_millis(config.supervision.watchdog_timeout_ms),
        device,
    ));
    let watchdog = bridge.clone();
    let watchdog_interval = Duration::from_millis(config.supervision.watchdog_interval_ms);
    tokio::spawn(async move { watchdog.monitor(watchdog_interval, &coordinator).await });

    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.supervision.main_loop_interval_ms));
    info!(
        "supervising {} processes",
        supervisor.registry().running_count().1
    );
    loop {
        ticker.tick().await;
        bridge.feed();
    }
}

/// Sanitizes `config` and scales staleness for processes that only report once per period.
pub fn prepare_config(config: &mut RuntimeConfig) {
    config.sanitize();
    let time_sync = config.period_scaled_stale_ms(config.time_sync_interval_ms());
    let ota = config.period_scaled_stale_ms(config.ota.check_interval_secs * 1_000);
    let net = config.period_scaled_stale_ms(config.network.check_interval_secs * 1_000);
    let cooling = config.period_scaled_stale_ms(
        config.cooling.conversion_wait_ms + config.cooling.read_interval_ms,
    );
    let overrides = &mut config.supervision.stale_overrides_ms;
    for (name, threshold) in [
        (processes::TIME_SYNC, time_sync),
        (processes::OTA_WORKER, ota),
        (processes::NET_MONITOR, net),
        (processes::SENSOR_COOLING, cooling),
    ] {
        overrides.entry(name.to_string()).or_insert(threshold);
    }
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_processes_get_scaled_thresholds() {
        let mut config = RuntimeConfig::default();
        prepare_config(&mut config);

        let overrides = &config.supervision.stale_overrides_ms;
        assert_eq!(overrides[processes::TIME_SYNC], 24 * 3_600_000 + 120_000);
        assert_eq!(overrides[processes::OTA_WORKER], 86_400_000 + 120_000);
        assert_eq!(overrides[processes::NET_MONITOR], 60_000 + 120_000);
        assert_eq!(overrides[processes::SENSOR_COOLING], 2_000 + 120_000);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_net_monitor_survives_health_sweeps() {
        let mut config = RuntimeConfig::default();
        config.network.check_interval_secs = 300;
        prepare_config(&mut config);
        let rig = processes::tests::rig(config);
        rig.device.link.store(true, Ordering::SeqCst);

        rig.supervisor.launch("health.monitor");
        rig.supervisor.launch(processes::NET_MONITOR);
        let started = rig
            .supervisor
            .registry()
            .started_at(processes::NET_MONITOR);

        tokio::time::sleep(Duration::from_secs(310)).await;

        let registry = rig.supervisor.registry();
        assert_eq!(registry.running_count(), (2, 2));
        assert_eq!(registry.started_at(processes::NET_MONITOR), started);
        assert_eq!(registry.restarted_count(), 0);
        assert_eq!(rig.device.reconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn configured_override_wins() {
        let mut config = RuntimeConfig::default();
        config
            .supervision
            .stale_overrides_ms
            .insert(processes::TIME_SYNC.to_string(), 600_000);
        prepare_config(&mut config);
        assert_eq!(
            config.supervision.stale_overrides_ms[processes::TIME_SYNC],
            600_000
        );
    }
}
