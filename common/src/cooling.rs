use crate::{
    config::CoolingConfig,
    types::{CoolingStage, CoolingStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCommand {
    LowOn,
    LowOff,
    HighOn,
    HighOff,
}

#[derive(Debug, Clone)]
pub struct CoolingEngine {
    pub config: CoolingConfig,

    current_temp_c: Option<f32>,
    low_on: bool,
    high_on: bool,
    // Boost hands control to the high stage until it reaches its off threshold.
    boosted: bool,
}

impl CoolingEngine {
    pub fn new(mut config: CoolingConfig) -> Self {
        config.sanitize();
        Self {
            config,
            current_temp_c: None,
            low_on: false,
            high_on: false,
            boosted: false,
        }
    }

    /// Forces both outputs off, used once when the control loop (re)starts.
    pub fn reset(&mut self) -> Vec<OutputCommand> {
        self.low_on = false;
        self.high_on = false;
        self.boosted = false;
        vec![OutputCommand::LowOff, OutputCommand::HighOff]
    }

    pub fn current_temp_c(&self) -> Option<f32> {
        self.current_temp_c
    }

    pub fn is_low_on(&self) -> bool {
        self.low_on
    }

    pub fn is_high_on(&self) -> bool {
        self.high_on
    }

    pub fn is_boosted(&self) -> bool {
        self.boosted
    }

    pub fn update(&mut self, temp_c: f32, boost_pressed: bool) -> Vec<OutputCommand> {
        let mut commands = Vec::new();
        self.current_temp_c = Some(temp_c);

        if boost_pressed && self.low_on {
            self.low_on = false;
            self.boosted = true;
            commands.push(OutputCommand::LowOff);
        }

        if self.boosted {
            self.evaluate_high(temp_c, &mut commands);
            if temp_c <= self.config.high_off_c {
                self.boosted = false;
                self.evaluate_low(temp_c, &mut commands);
            }
        } else {
            self.evaluate_low(temp_c, &mut commands);
        }

        commands
    }

    pub fn is_alarm(&self) -> bool {
        self.current_temp_c
            .map(|temp| temp >= self.config.alarm_c)
            .unwrap_or(false)
    }

    pub fn stage(&self) -> CoolingStage {
        match (self.boosted, self.high_on, self.low_on) {
            (true, true, _) => CoolingStage::High,
            (true, false, _) => CoolingStage::BoostIdle,
            (false, _, true) => CoolingStage::Low,
            _ => CoolingStage::Off,
        }
    }

    /// Returns the `(off, on)` thresholds of the stage currently in control.
    pub fn active_thresholds(&self) -> (f32, f32) {
        if self.boosted {
            (self.config.high_off_c, self.config.high_on_c)
        } else {
            (self.config.low_off_c, self.config.low_on_c)
        }
    }

    pub fn status(&self) -> CoolingStatus {
        let (off_c, on_c) = self.active_thresholds();
        CoolingStatus {
            temperature_c: self.current_temp_c,
            stage: self.stage().as_str(),
            low_on: self.low_on,
            high_on: self.high_on,
            boosted: self.boosted,
            threshold_off_c: off_c,
            threshold_on_c: on_c,
            alarm: self.is_alarm(),
            alarm_c: self.config.alarm_c,
        }
    }

    fn evaluate_low(&mut self, temp_c: f32, commands: &mut Vec<OutputCommand>) {
        if temp_c >= self.config.low_on_c && !self.low_on {
            self.low_on = true;
            commands.push(OutputCommand::LowOn);
        } else if temp_c <= self.config.low_off_c && self.low_on {
            self.low_on = false;
            commands.push(OutputCommand::LowOff);
        }
    }

    fn evaluate_high(&mut self, temp_c: f32, commands: &mut Vec<OutputCommand>) {
        if temp_c >= self.config.high_on_c && !self.high_on {
            self.high_on = true;
            commands.push(OutputCommand::HighOn);
        } else if temp_c <= self.config.high_off_c && self.high_on {
            self.high_on = false;
            commands.push(OutputCommand::HighOff);
        }
    }
}
