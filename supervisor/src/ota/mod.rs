//! Staged application updates.
//!
//! Three files make up the transaction: the live image, `<live>.staging` for the
//! candidate and `<live>.backup` for the previous good image. Whether a backup exists
//! is the only state the boot check needs to finish or undo an interrupted swap.

pub mod boot;
pub mod image;
pub mod layout;
pub mod manager;
pub mod remote;
pub mod version;

pub use boot::{run_boot_check, verify_boot, BootOutcome};
pub use image::{encode_image, sha256_hex, ImageValidator, Validation, Validator};
pub use layout::UpdateLayout;
pub use manager::{UpdateManager, UpdateOutcome, UpdatePhase, UpdateStatus};
#[cfg(not(any(target_arch = "xtensa", target_arch = "riscv32")))]
pub use remote::GithubRawSource;
pub use remote::RemoteSource;
pub use version::{read_local_version, VersionId, VersionManifest};
