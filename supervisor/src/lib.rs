//! Process supervision and self-update for the fridge monitor firmware.
//!
//! Every long-running piece of the device runs as a named process in the
//! [`Registry`]. Two monitors police it: the health monitor cancels processes
//! that stop reporting, the liveness monitor relaunches finished ones through
//! the [`DispatchTable`]. The [`WatchdogBridge`] and [`RestartCoordinator`]
//! cover the case where supervision itself stalls, and [`ota`] replaces the
//! application image with a rollback that survives power loss.

pub mod error;
pub mod health;
pub mod liveness;
pub mod ota;
pub mod process;
pub mod registry;
pub mod restart;
pub mod supervisor;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Fault, UpdateError};
pub use health::{StalenessPolicy, HEALTH_MONITOR};
pub use liveness::LIVENESS_MONITOR;
pub use process::{launcher, DispatchTable, Launcher, ProcessCtx, ProcessFuture};
pub use registry::{ProcessHandle, ProcessSnapshot, ProcessStatus, Registry};
pub use restart::{Device, RestartCoordinator, RestartReason};
pub use supervisor::Supervisor;
pub use watchdog::WatchdogBridge;
