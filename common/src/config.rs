use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoolingConfig {
    pub low_on_c: f32,
    pub low_off_c: f32,
    pub high_on_c: f32,
    pub high_off_c: f32,
    pub alarm_c: f32,
    pub read_interval_ms: u64,
    pub conversion_wait_ms: u64,
}

impl Default for CoolingConfig {
    fn default() -> Self {
        Self {
            low_on_c: 28.0,
            low_off_c: 27.0,
            high_on_c: 27.5,
            high_off_c: 26.5,
            alarm_c: 29.0,
            read_interval_ms: 1_250,
            conversion_wait_ms: 750,
        }
    }
}

impl CoolingConfig {
    pub fn sanitize(&mut self) {
        if self.low_off_c >= self.low_on_c {
            self.low_off_c = self.low_on_c - 1.0;
        }
        if self.high_off_c >= self.high_on_c {
            self.high_off_c = self.high_on_c - 1.0;
        }
        self.read_interval_ms = self.read_interval_ms.max(100);
        self.conversion_wait_ms = self.conversion_wait_ms.clamp(10, 1_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisionConfig {
    pub health_interval_ms: u64,
    pub liveness_interval_ms: u64,
    pub default_stale_ms: u64,
    /// Per-process staleness thresholds that replace `default_stale_ms`.
    pub stale_overrides_ms: BTreeMap<String, u64>,
    pub watchdog_timeout_ms: u64,
    pub watchdog_interval_ms: u64,
    pub hardware_watchdog_timeout_ms: u64,
    pub main_loop_interval_ms: u64,
    pub restart_grace_ms: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 10_000,
            liveness_interval_ms: 15_000,
            default_stale_ms: 120_000,
            stale_overrides_ms: BTreeMap::new(),
            watchdog_timeout_ms: 30_000,
            watchdog_interval_ms: 5_000,
            hardware_watchdog_timeout_ms: 60_000,
            main_loop_interval_ms: 1_000,
            restart_grace_ms: 10_000,
        }
    }
}

impl SupervisionConfig {
    pub fn sanitize(&mut self) {
        self.health_interval_ms = self.health_interval_ms.max(100);
        self.liveness_interval_ms = self.liveness_interval_ms.max(100);
        self.watchdog_interval_ms = self.watchdog_interval_ms.max(100);
        self.main_loop_interval_ms = self.main_loop_interval_ms.max(10);

        // Every health feed must land strictly inside the thresholds.
        let min_stale = self.health_interval_ms.max(self.liveness_interval_ms) * 2;
        self.default_stale_ms = self.default_stale_ms.max(min_stale);
        for threshold in self.stale_overrides_ms.values_mut() {
            *threshold = (*threshold).max(min_stale);
        }

        if self.watchdog_timeout_ms <= self.main_loop_interval_ms {
            self.watchdog_timeout_ms = self.main_loop_interval_ms * 30;
        }
        if self.hardware_watchdog_timeout_ms <= self.watchdog_timeout_ms {
            self.hardware_watchdog_timeout_ms = self.watchdog_timeout_ms * 2;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OtaConfig {
    pub enabled: bool,
    pub user: String,
    pub repo: String,
    pub branch: String,
    pub app_path: String,
    pub version_path: String,
    pub token: String,
    pub check_interval_secs: u64,
    pub live_file: String,
    pub version_file: String,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user: String::new(),
            repo: String::new(),
            branch: "main".to_string(),
            app_path: "app.img".to_string(),
            version_path: "version.json".to_string(),
            token: String::new(),
            check_interval_secs: 86_400,
            live_file: "app.img".to_string(),
            version_file: "version.json".to_string(),
        }
    }
}

impl OtaConfig {
    pub fn sanitize(&mut self) {
        self.check_interval_secs = self.check_interval_secs.max(60);
        if self.branch.trim().is_empty() {
            self.branch = "main".to_string();
        }
    }

    pub fn is_configured(&self) -> bool {
        self.enabled && !self.user.is_empty() && !self.repo.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub check_interval_secs: u64,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            check_interval_secs: 60,
            mqtt_host: String::new(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub cooling: CoolingConfig,
    pub supervision: SupervisionConfig,
    pub ota: OtaConfig,
    pub network: NetworkConfig,
    pub timezone: String,
    pub time_sync_interval_hours: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cooling: CoolingConfig::default(),
            supervision: SupervisionConfig::default(),
            ota: OtaConfig::default(),
            network: NetworkConfig::default(),
            timezone: "Europe/Stockholm".to_string(),
            time_sync_interval_hours: 24,
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.cooling.sanitize();
        self.ota.sanitize();
        self.time_sync_interval_hours = self.time_sync_interval_hours.clamp(1, 24 * 7);
        self.network.check_interval_secs = self.network.check_interval_secs.max(5);
        self.supervision.sanitize();
    }

    pub fn time_sync_interval_ms(&self) -> u64 {
        self.time_sync_interval_hours * 3_600_000
    }

    /// Staleness threshold for a process that only reports once per `period_ms`.
    pub fn period_scaled_stale_ms(&self, period_ms: u64) -> u64 {
        period_ms.saturating_add(self.supervision.default_stale_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let raw = r#"{"cooling":{"alarm_c":31.0},"timezone":"Europe/Oslo"}"#;
        let config: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.cooling.alarm_c, 31.0);
        assert_eq!(config.cooling.low_on_c, 28.0);
        assert_eq!(config.supervision, SupervisionConfig::default());
        assert_eq!(config.timezone, "Europe/Oslo");
        assert_eq!(config.time_sync_interval_hours, 24);
    }

    #[test]
    fn sanitize_keeps_thresholds_above_sweep_intervals() {
        let mut config = RuntimeConfig::default();
        config.supervision.default_stale_ms = 1_000;
        config
            .supervision
            .stale_overrides_ms
            .insert("time.sync".to_string(), 5);
        config.sanitize();

        assert_eq!(config.supervision.default_stale_ms, 30_000);
        assert_eq!(config.supervision.stale_overrides_ms["time.sync"], 30_000);
    }

    #[test]
    fn sanitize_orders_watchdog_timeouts() {
        let mut config = RuntimeConfig::default();
        config.supervision.hardware_watchdog_timeout_ms = 10_000;
        config.sanitize();

        assert!(
            config.supervision.hardware_watchdog_timeout_ms
                > config.supervision.watchdog_timeout_ms
        );
    }

    #[test]
    fn sanitize_repairs_inverted_hysteresis() {
        let mut cooling = CoolingConfig {
            low_off_c: 29.0,
            ..CoolingConfig::default()
        };
        cooling.sanitize();
        assert_eq!(cooling.low_off_c, 27.0);
    }

    #[test]
    fn period_scaled_threshold_adds_default() {
        let config = RuntimeConfig::default();
        assert_eq!(
            config.period_scaled_stale_ms(config.time_sync_interval_ms()),
            86_400_000 + 120_000
        );
    }
}
