pub mod config;
pub mod cooling;
pub mod display;
pub mod history;
pub mod power;
pub mod probe;
pub mod topics;
pub mod types;

pub use config::{CoolingConfig, NetworkConfig, OtaConfig, RuntimeConfig, SupervisionConfig};
pub use cooling::{CoolingEngine, OutputCommand};
pub use display::{compose_frame, FrameInput, StatusFrame};
pub use history::TemperatureHistory;
pub use power::{PowerRegister, INA260_ADDR};
pub use topics::*;
pub use types::{ControllerStatePayload, CoolingStage, CoolingStatus, HistoryStatus, PowerReading};
