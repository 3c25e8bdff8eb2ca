use core::convert::TryInto;
use std::{
    io::Write as _,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::{Datelike, Utc};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Read,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        delay::{Ets, BLOCK},
        gpio::{
            AnyIOPin, AnyInputPin, AnyOutputPin, IOPin, Input, InputOutput, InputPin, Output,
            OutputPin, PinDriver, Pull,
        },
        i2c::{I2cConfig, I2cDriver},
        interrupt,
        modem::Modem,
        prelude::Peripherals,
        units::Hertz,
    },
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use fridge_common::{
    power::{reading_from_raw, word_from_be},
    probe::{self, ScratchpadError, SCRATCHPAD_LEN},
    NetworkConfig, OtaConfig, OutputCommand, PowerReading, PowerRegister, RuntimeConfig,
    StatusFrame, INA260_ADDR,
};
use fridge_supervisor::{ota::RemoteSource, Device, RestartReason, UpdateError};
use log::{debug, info, warn};

use crate::{
    app::{self, Platform},
    board::{Board, BoardError},
};

const NVS_NAMESPACE: &str = "fridge";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const DATA_DIR: &str = "/spiffs";
const DATA_PARTITION: &core::ffi::CStr = c"storage";
const DATA_BASE_PATH: &core::ffi::CStr = c"/spiffs";
const HTTP_CHUNK_SIZE: usize = 4096;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const AGENT: &str = concat!("fridge-monitor/", env!("CARGO_PKG_VERSION"));
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const I2C_BAUDRATE: u32 = 100_000;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };
    let config = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`",
        config.network.wifi_ssid, config.network.mqtt_host, config.network.mqtt_port,
    );

    let Peripherals {
        modem, pins, i2c0, ..
    } = Peripherals::take()?;

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &config.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();
    let local_ip = wifi
        .sta_netif()
        .get_ip_info()
        .ok()
        .map(|info| info.ip)
        .filter(|ip| !ip.is_unspecified());

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    mount_data_partition()?;

    let timeout_ms = config.supervision.hardware_watchdog_timeout_ms;
    init_watchdog(timeout_ms.try_into().unwrap_or(u32::MAX))?;
    add_current_task_to_watchdog()?;

    let one_wire = PinDriver::input_output_od(pins.gpio4.downgrade())?;
    let low_relay = PinDriver::output(pins.gpio5.downgrade_output())?;
    let high_relay = PinDriver::output(pins.gpio18.downgrade_output())?;
    let mut button = PinDriver::input(pins.gpio19.downgrade_input())?;
    button.set_pull(Pull::Up)?;
    let i2c = I2cDriver::new(
        i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(Hertz(I2C_BAUDRATE)),
    )?;

    let board = EspBoard {
        probe: Mutex::new(OneWire { pin: one_wire }),
        power: Mutex::new(i2c),
        low_relay: Mutex::new(low_relay),
        high_relay: Mutex::new(high_relay),
        button: Mutex::new(button),
        local_ip,
    };

    let remote = config
        .ota
        .is_configured()
        .then(|| EspHttpSource::from_config(&config.ota));
    let platform = Platform {
        board: Arc::new(board),
        device: Arc::new(EspDevice),
        data_dir: PathBuf::from(DATA_DIR),
        config,
        remote,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    let result = runtime.block_on(app::run(platform));

    // Keep the radio up until the runtime is gone.
    drop(wifi);
    result
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    let ssid = network.wifi_ssid.trim();
    !ssid.is_empty() && ssid != "CHANGE_ME"
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !has_station_credentials(network) {
        warn!("wifi credentials missing; running offline");
        return Ok(esp_wifi);
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                return Ok(esp_wifi);
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}")
            }
        }
        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    // The network monitor keeps retrying once the supervisor is up.
    warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; starting offline");
    Ok(esp_wifi)
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn mount_data_partition() -> anyhow::Result<()> {
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: DATA_BASE_PATH.as_ptr(),
        partition_label: DATA_PARTITION.as_ptr(),
        max_files: 5,
        format_if_mount_failed: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        info!("data partition mounted at {DATA_DIR}");
        return Ok(());
    }
    Err(anyhow!("esp_vfs_spiffs_register failed with code {}", rc))
}

fn init_watchdog(timeout_ms: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms,
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK {
        return Ok(());
    }
    if rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        // Already started by the bootloader config; apply our timeout instead.
        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_reconfigure(&config) };
        if rc == esp_idf_svc::sys::ESP_OK {
            return Ok(());
        }
        return Err(anyhow!("esp_task_wdt_reconfigure failed with code {}", rc));
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn restart_now() {
    unsafe { esp_idf_svc::sys::esp_restart() }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

/// Task watchdog, radio and `esp_restart` behind the supervisor's device seam.
struct EspDevice;

impl Device for EspDevice {
    fn link_up(&self) -> bool {
        is_wifi_station_connected()
    }

    fn reconnect(&self) {
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("esp_wifi_connect failed: esp_err_t={rc}");
        }
    }

    fn teardown_network(&self) {
        unsafe {
            esp_idf_svc::sys::esp_wifi_disconnect();
            esp_idf_svc::sys::esp_wifi_stop();
        }
        info!("wifi stopped");
    }

    fn feed_hardware_watchdog(&self) {
        let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
    }

    fn arm_reset_fallback(&self, after: Duration) {
        let spawned = thread::Builder::new()
            .name("reset-fallback".into())
            .stack_size(4096)
            .spawn(move || {
                thread::sleep(after);
                warn!("graceful restart stalled for {}ms; forcing reset", after.as_millis());
                restart_now();
            });
        if let Err(err) = spawned {
            warn!("failed to arm reset fallback: {err}");
        }
    }

    fn reset(&self, reason: &RestartReason) {
        info!("restarting: {reason}");
        restart_now();
    }
}

/// Bit-banged DS18B20 bus; slot timings are held with interrupts masked.
struct OneWire {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
}

impl OneWire {
    fn reset(&mut self) -> bool {
        let _ = self.pin.set_low();
        Ets::delay_us(480);
        let present = interrupt::free(|| {
            let _ = self.pin.set_high();
            Ets::delay_us(70);
            self.pin.is_low()
        });
        Ets::delay_us(410);
        present
    }

    fn write_bit(&mut self, one: bool) {
        let (low_us, release_us) = if one { (6, 64) } else { (60, 10) };
        interrupt::free(|| {
            let _ = self.pin.set_low();
            Ets::delay_us(low_us);
            let _ = self.pin.set_high();
        });
        Ets::delay_us(release_us);
    }

    fn read_bit(&mut self) -> bool {
        let bit = interrupt::free(|| {
            let _ = self.pin.set_low();
            Ets::delay_us(6);
            let _ = self.pin.set_high();
            Ets::delay_us(9);
            self.pin.is_high()
        });
        Ets::delay_us(55);
        bit
    }

    fn write_byte(&mut self, byte: u8) {
        for bit in 0..8 {
            self.write_bit(((byte >> bit) & 1) == 1);
        }
    }

    fn read_byte(&mut self) -> u8 {
        (0..8).fold(0, |byte, bit| byte | (u8::from(self.read_bit()) << bit))
    }

    fn command(&mut self, command: u8) -> Result<(), BoardError> {
        if !self.reset() {
            return Err(BoardError::ProbeMissing);
        }
        self.write_byte(probe::CMD_SKIP_ROM);
        self.write_byte(command);
        Ok(())
    }
}

struct EspBoard {
    probe: Mutex<OneWire>,
    power: Mutex<I2cDriver<'static>>,
    low_relay: Mutex<PinDriver<'static, AnyOutputPin, Output>>,
    high_relay: Mutex<PinDriver<'static, AnyOutputPin, Output>>,
    button: Mutex<PinDriver<'static, AnyInputPin, Input>>,
    local_ip: Option<Ipv4Addr>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_register(
    i2c: &mut I2cDriver<'static>,
    register: PowerRegister,
) -> Result<u16, BoardError> {
    let mut word = [0_u8; 2];
    i2c.write_read(INA260_ADDR, &[register.address()], &mut word, BLOCK)
        .map_err(|err| BoardError::Bus(format!("ina260 {register:?}: {err}")))?;
    Ok(word_from_be(word))
}

impl Board for EspBoard {
    fn start_conversion(&self) -> Result<(), BoardError> {
        locked(&self.probe).command(probe::CMD_CONVERT_T)
    }

    fn read_temperature(&self) -> Result<f32, BoardError> {
        let mut pad = [0_u8; SCRATCHPAD_LEN];
        {
            let mut bus = locked(&self.probe);
            bus.command(probe::CMD_READ_SCRATCHPAD)?;
            for byte in pad.iter_mut() {
                *byte = bus.read_byte();
            }
        }
        probe::decode_scratchpad(&pad).map_err(|err| match err {
            ScratchpadError::Absent => BoardError::ProbeMissing,
            ScratchpadError::Crc { .. } => BoardError::Crc,
            ScratchpadError::NotConverted => BoardError::Bus("conversion not finished".into()),
        })
    }

    fn read_power(&self) -> Result<PowerReading, BoardError> {
        let mut i2c = locked(&self.power);
        let current = read_register(&mut i2c, PowerRegister::Current)?;
        let voltage = read_register(&mut i2c, PowerRegister::BusVoltage)?;
        let power = read_register(&mut i2c, PowerRegister::Power)?;
        Ok(reading_from_raw(current, voltage, power))
    }

    fn apply(&self, command: OutputCommand) {
        let result = match command {
            OutputCommand::LowOn => locked(&self.low_relay).set_high(),
            OutputCommand::LowOff => locked(&self.low_relay).set_low(),
            OutputCommand::HighOn => locked(&self.high_relay).set_high(),
            OutputCommand::HighOff => locked(&self.high_relay).set_low(),
        };
        if let Err(err) = result {
            warn!("failed to drive relay for {command:?}: {err}");
        }
    }

    fn boost_pressed(&self) -> bool {
        locked(&self.button).is_low()
    }

    fn render(&self, frame: &StatusFrame) {
        debug!("display: {}", frame.lines.join(" | "));
    }

    fn sync_clock(&self) -> Result<(), BoardError> {
        let year = Utc::now().year();
        if year < 2024 {
            return Err(BoardError::Clock(format!("sntp has not set the clock (year {year})")));
        }
        Ok(())
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.local_ip
    }
}

/// Raw GitHub files fetched with the IDF HTTP client on a blocking worker.
#[derive(Debug, Clone)]
pub struct EspHttpSource {
    base: String,
    token: Option<String>,
}

impl EspHttpSource {
    pub fn from_config(config: &OtaConfig) -> Self {
        Self {
            base: format!(
                "https://raw.githubusercontent.com/{}/{}/{}",
                config.user, config.repo, config.branch
            ),
            token: Some(config.token.clone()).filter(|token| !token.is_empty()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }
}

impl RemoteSource for EspHttpSource {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, UpdateError> {
        let (url, token, path) = (self.url(path), self.token.clone(), path.to_string());
        blocking(move || {
            let mut body = Vec::new();
            http_get(&url, token.as_deref(), &path, |chunk| {
                body.extend_from_slice(chunk);
                Ok(())
            })?;
            Ok(body)
        })
        .await
    }

    async fn download(&self, path: &str, dest: &Path) -> Result<u64, UpdateError> {
        let (url, token, path) = (self.url(path), self.token.clone(), path.to_string());
        let dest = dest.to_path_buf();
        blocking(move || {
            let mut file = std::fs::File::create(&dest)?;
            let total = http_get(&url, token.as_deref(), &path, |chunk| file.write_all(chunk))?;
            file.sync_all()?;
            Ok(total)
        })
        .await
    }
}

async fn blocking<T, F>(job: F) -> Result<T, UpdateError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, UpdateError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|err| UpdateError::Network(format!("http worker failed: {err}")))?
}

fn http_get(
    url: &str,
    token: Option<&str>,
    path: &str,
    mut sink: impl FnMut(&[u8]) -> std::io::Result<()>,
) -> Result<u64, UpdateError> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(HTTP_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf).map_err(esp_network)?);

    let bearer = token.map(|token| format!("Bearer {token}"));
    let mut headers = vec![("User-Agent", AGENT)];
    if let Some(bearer) = bearer.as_deref() {
        headers.push(("Authorization", bearer));
    }
    let request = client
        .request(Method::Get, url, &headers)
        .map_err(esp_network)?;
    let mut response = request.submit().map_err(esp_network)?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(UpdateError::Http {
            status,
            path: path.to_string(),
        });
    }

    let mut total = 0_u64;
    let mut chunk = [0_u8; HTTP_CHUNK_SIZE];
    loop {
        let read = response.read(&mut chunk).map_err(esp_network)?;
        if read == 0 {
            break;
        }
        sink(&chunk[..read])?;
        total = total.saturating_add(read as u64);
    }
    Ok(total)
}

fn esp_network(err: impl core::fmt::Debug) -> UpdateError {
    UpdateError::Network(format!("{err:?}"))
}
