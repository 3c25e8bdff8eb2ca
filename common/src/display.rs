use chrono::NaiveDateTime;

use crate::types::{CoolingStatus, HistoryStatus, PowerReading};

/// Text content of one status screen refresh. Pixel layout is up to the panel driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFrame {
    pub lines: Vec<String>,
    /// Alarm blink phase; the panel draws inverted while set.
    pub inverted: bool,
}

#[derive(Debug, Clone)]
pub struct FrameInput<'a> {
    pub local_time: Option<NaiveDateTime>,
    pub cooling: &'a CoolingStatus,
    pub history: HistoryStatus,
    pub power: Option<PowerReading>,
    pub tasks_running: usize,
    pub tasks_total: usize,
    pub tick: u64,
}

pub fn compose_frame(input: &FrameInput<'_>) -> StatusFrame {
    let clock = input
        .local_time
        .map(|time| time.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let temperature = input
        .cooling
        .temperature_c
        .map(|temp| format!("{temp:.1} C"))
        .unwrap_or_else(|| "--.- C".to_string());
    let extremes = match (input.history.min_c, input.history.max_c) {
        (Some(min), Some(max)) => format!("24h {min:.1}/{max:.1}"),
        _ => "24h --/--".to_string(),
    };
    let power = input
        .power
        .map(|reading| reading.display_line())
        .unwrap_or_else(|| "V:-- I:-- P:--".to_string());

    StatusFrame {
        lines: vec![
            clock,
            temperature,
            format!("Stage: {}", input.cooling.stage),
            format!(
                "Off {:.1} On {:.1}",
                input.cooling.threshold_off_c, input.cooling.threshold_on_c
            ),
            extremes,
            power,
            format!("Tasks {}/{}", input.tasks_running, input.tasks_total),
        ],
        inverted: input.cooling.alarm && input.tick % 2 == 1,
    }
}
