use std::{
    io::ErrorKind,
    net::{Ipv4Addr, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{Datelike, Utc};
use fridge_common::{
    power::reading_from_raw, OutputCommand, PowerReading, RuntimeConfig, StatusFrame,
};
use fridge_supervisor::{ota::GithubRawSource, Device, RestartReason};
use tracing::{debug, error, info, warn};

use crate::{
    app::{self, Platform},
    board::{Board, BoardError},
};

/// Exit status the service manager sees when the device "resets".
const RESET_EXIT_CODE: i32 = 3;
const AMBIENT_DRIFT_C: f32 = 0.04;
const LOW_STAGE_PULL_C: f32 = 0.09;
const HIGH_STAGE_PULL_C: f32 = 0.16;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut config = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut config);

    let remote = if config.ota.is_configured() {
        match GithubRawSource::from_config(&config.ota) {
            Ok(source) => Some(source),
            Err(err) => {
                warn!("ota source unavailable: {err}");
                None
            }
        }
    } else {
        None
    };

    let hardware_timeout = Duration::from_millis(config.supervision.hardware_watchdog_timeout_ms);
    let platform = Platform {
        board: Arc::new(SimBoard::new()),
        device: Arc::new(HostDevice::new(hardware_timeout)),
        data_dir: store.data_dir.clone(),
        config,
        remote,
    };
    app::run(platform).await
}

fn apply_env_overrides(config: &mut RuntimeConfig) {
    let network = &mut config.network;
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = env_parse::<u16>("MQTT_PORT") {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
    if let Some(port) = env_parse::<u16>("FRIDGE_HTTP_PORT") {
        network.http_port = port;
    }
    if let Ok(token) = std::env::var("OTA_TOKEN") {
        config.ota.token = token;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

#[derive(Clone)]
struct AppStore {
    data_dir: PathBuf,
    runtime_path: PathBuf,
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("FRIDGE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.fridge"));
        Self::at(data_dir)
    }

    fn at(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: data_dir.join("runtime.json"),
            data_dir,
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Thermal {
    temp_c: f32,
    low_on: bool,
    high_on: bool,
}

/// Simulated probe, relays and INA260 for running the controller off-board.
struct SimBoard {
    thermal: Mutex<Thermal>,
}

impl SimBoard {
    fn new() -> Self {
        Self {
            thermal: Mutex::new(Thermal {
                temp_c: 27.0,
                low_on: false,
                high_on: false,
            }),
        }
    }

    fn thermal(&self) -> std::sync::MutexGuard<'_, Thermal> {
        self.thermal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Board for SimBoard {
    fn start_conversion(&self) -> Result<(), BoardError> {
        let mut thermal = self.thermal();
        let pull = match (thermal.low_on, thermal.high_on) {
            (_, true) => HIGH_STAGE_PULL_C,
            (true, false) => LOW_STAGE_PULL_C,
            _ => 0.0,
        };
        thermal.temp_c += AMBIENT_DRIFT_C - pull;
        Ok(())
    }

    fn read_temperature(&self) -> Result<f32, BoardError> {
        Ok((self.thermal().temp_c * 16.0).round() / 16.0)
    }

    fn read_power(&self) -> Result<PowerReading, BoardError> {
        let thermal = *self.thermal();
        let amps: f32 = match (thermal.low_on, thermal.high_on) {
            (_, true) => 2.3,
            (true, false) => 1.1,
            _ => 0.05,
        };
        let volts: f32 = 12.1;
        let current = (amps * 1_000.0 / 1.25) as u16;
        let voltage = (volts * 1_000.0 / 1.25) as u16;
        let power = (amps * volts * 1_000.0 / 10.0) as u16;
        Ok(reading_from_raw(current, voltage, power))
    }

    fn apply(&self, command: OutputCommand) {
        let mut thermal = self.thermal();
        match command {
            OutputCommand::LowOn => thermal.low_on = true,
            OutputCommand::LowOff => thermal.low_on = false,
            OutputCommand::HighOn => thermal.high_on = true,
            OutputCommand::HighOff => thermal.high_on = false,
        }
    }

    fn boost_pressed(&self) -> bool {
        false
    }

    fn render(&self, frame: &StatusFrame) {
        debug!(inverted = frame.inverted, "display: {}", frame.lines.join(" | "));
    }

    fn sync_clock(&self) -> Result<(), BoardError> {
        let year = Utc::now().year();
        if year < 2024 {
            return Err(BoardError::Clock(format!("system clock reports year {year}")));
        }
        Ok(())
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        match socket.local_addr().ok()?.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(_) => None,
        }
    }
}

/// Process-level stand-in for the board: resets exit the process, and an OS thread plays
/// the hardware watchdog.
struct HostDevice {
    last_fed: Arc<Mutex<Instant>>,
    link: AtomicBool,
}

impl HostDevice {
    fn new(hardware_timeout: Duration) -> Self {
        let last_fed = Arc::new(Mutex::new(Instant::now()));
        spawn_hardware_watchdog(last_fed.clone(), hardware_timeout);
        Self {
            last_fed,
            link: AtomicBool::new(true),
        }
    }
}

fn spawn_hardware_watchdog(last_fed: Arc<Mutex<Instant>>, timeout: Duration) {
    let check_every = (timeout / 4).max(Duration::from_millis(100));
    thread::spawn(move || loop {
        thread::sleep(check_every);
        let silent = last_fed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        if silent > timeout {
            error!("hardware watchdog expired after {}ms", silent.as_millis());
            std::process::exit(RESET_EXIT_CODE);
        }
    });
}

impl Device for HostDevice {
    fn link_up(&self) -> bool {
        self.link.load(Ordering::Relaxed)
    }

    fn reconnect(&self) {
        info!("reconnecting network link");
        self.link.store(true, Ordering::Relaxed);
    }

    fn teardown_network(&self) {
        info!("network torn down");
        self.link.store(false, Ordering::Relaxed);
    }

    fn feed_hardware_watchdog(&self) {
        *self.last_fed.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn arm_reset_fallback(&self, after: Duration) {
        thread::spawn(move || {
            thread::sleep(after);
            error!("graceful restart did not finish within {}ms", after.as_millis());
            std::process::exit(RESET_EXIT_CODE);
        });
    }

    fn reset(&self, reason: &RestartReason) {
        info!("device reset: {reason}");
        std::process::exit(RESET_EXIT_CODE);
    }
}
