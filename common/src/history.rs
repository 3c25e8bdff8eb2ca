use std::collections::VecDeque;

use crate::types::HistoryStatus;

pub const HISTORY_WINDOW_SECS: i64 = 86_400;

/// Rolling 24h window of temperature readings keyed by wall-clock seconds.
#[derive(Debug, Clone, Default)]
pub struct TemperatureHistory {
    samples: VecDeque<(i64, f32)>,
}

impl TemperatureHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, now_epoch: i64, temp_c: f32) {
        if !temp_c.is_finite() {
            return;
        }
        self.samples.push_back((now_epoch, temp_c));

        let cutoff = now_epoch - HISTORY_WINDOW_SECS;
        self.samples.retain(|(at, _)| *at >= cutoff);
    }

    pub fn min(&self) -> Option<f32> {
        self.samples
            .iter()
            .map(|(_, temp)| *temp)
            .reduce(f32::min)
    }

    pub fn max(&self) -> Option<f32> {
        self.samples
            .iter()
            .map(|(_, temp)| *temp)
            .reduce(f32::max)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn status(&self) -> HistoryStatus {
        HistoryStatus {
            min_c: self.min(),
            max_c: self.max(),
            samples: self.len(),
        }
    }
}
