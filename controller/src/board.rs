use std::net::Ipv4Addr;

use fridge_common::{OutputCommand, PowerReading, StatusFrame};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("no temperature probe answered on the bus")]
    ProbeMissing,
    #[error("probe scratchpad crc mismatch")]
    Crc,
    #[error("bus error: {0}")]
    Bus(String),
    #[error("clock not synchronised: {0}")]
    Clock(String),
}

/// Sensors, relays and panel of the fridge controller board.
pub trait Board: Send + Sync + 'static {
    /// Starts a temperature conversion; the result is ready after the configured wait.
    fn start_conversion(&self) -> Result<(), BoardError>;

    fn read_temperature(&self) -> Result<f32, BoardError>;

    fn read_power(&self) -> Result<PowerReading, BoardError>;

    fn apply(&self, command: OutputCommand);

    fn boost_pressed(&self) -> bool;

    fn render(&self, frame: &StatusFrame);

    fn sync_clock(&self) -> Result<(), BoardError>;

    fn local_ip(&self) -> Option<Ipv4Addr>;
}
