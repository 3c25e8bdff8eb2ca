use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoolingStage {
    Off,
    Low,
    High,
    BoostIdle,
}

impl CoolingStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "Off",
            Self::Low => "Low",
            Self::High => "High",
            Self::BoostIdle => "Off!!",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoolingStatus {
    #[serde(rename = "temperatureC")]
    pub temperature_c: Option<f32>,
    pub stage: &'static str,
    #[serde(rename = "lowOn")]
    pub low_on: bool,
    #[serde(rename = "highOn")]
    pub high_on: bool,
    pub boosted: bool,
    #[serde(rename = "thresholdOffC")]
    pub threshold_off_c: f32,
    #[serde(rename = "thresholdOnC")]
    pub threshold_on_c: f32,
    pub alarm: bool,
    #[serde(rename = "alarmC")]
    pub alarm_c: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerReading {
    pub volts: f32,
    pub amps: f32,
    pub watts: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryStatus {
    #[serde(rename = "minC")]
    pub min_c: Option<f32>,
    #[serde(rename = "maxC")]
    pub max_c: Option<f32>,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatePayload {
    pub temp: Option<f32>,
    pub stage: &'static str,
    pub alarm: bool,
    #[serde(rename = "min24h")]
    pub min_24h: Option<f32>,
    #[serde(rename = "max24h")]
    pub max_24h: Option<f32>,
    pub power: Option<PowerReading>,
    #[serde(rename = "tasksRunning")]
    pub tasks_running: usize,
    #[serde(rename = "tasksTotal")]
    pub tasks_total: usize,
    #[serde(rename = "restartedCount")]
    pub restarted_count: u64,
    #[serde(rename = "uptimeSecs")]
    pub uptime_secs: u64,
    pub version: Option<String>,
}
