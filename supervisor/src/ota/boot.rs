use std::{io, sync::Arc};

use tracing::{error, info, warn};

use super::{
    image::{Validation, Validator},
    layout::{exists, remove_if_exists, UpdateLayout},
};
use crate::{
    error::Fault,
    restart::{RestartCoordinator, RestartReason},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    /// Live image only, nothing to confirm.
    Clean,
    /// The swapped-in image validated; its backup was deleted.
    Confirmed,
    /// The swapped-in image was invalid and the backup is live again.
    RolledBack { reason: String },
    /// A swap was interrupted before the new image landed; the backup is live again.
    Restored,
    /// Neither a live image nor a backup exists.
    Missing,
}

impl BootOutcome {
    pub fn requires_restart(&self) -> bool {
        matches!(self, Self::RolledBack { .. })
    }
}

/// Settles whatever update transaction the previous boot left behind.
///
/// Runs before any process starts. Running it again on its own result changes nothing.
/// A rollback also restores the version manifest saved at swap time, or drops the version
/// file when none was saved, so the next check sees a mismatch and retries the update.
pub async fn verify_boot(
    layout: &UpdateLayout,
    validator: &impl Validator,
) -> io::Result<BootOutcome> {
    if remove_if_exists(&layout.staging).await? {
        info!("removed stale staging file {}", layout.staging.display());
    }

    let has_backup = exists(&layout.backup).await?;
    let has_live = exists(&layout.live).await?;

    let outcome = match (has_backup, has_live) {
        (true, true) => {
            let live = tokio::fs::read(&layout.live).await?;
            match validator.validate(&live) {
                Validation::Valid => {
                    tokio::fs::remove_file(&layout.backup).await?;
                    remove_if_exists(&layout.version_backup).await?;
                    info!("update confirmed, backup removed");
                    BootOutcome::Confirmed
                }
                Validation::Invalid(reason) => {
                    error!("{}", Fault::CorruptState(reason.clone()));
                    tokio::fs::remove_file(&layout.live).await?;
                    tokio::fs::rename(&layout.backup, &layout.live).await?;
                    if !restore_version(layout).await? {
                        remove_if_exists(&layout.version).await?;
                    }
                    BootOutcome::RolledBack { reason }
                }
            }
        }
        (true, false) => {
            warn!("interrupted update found, restoring backup");
            tokio::fs::rename(&layout.backup, &layout.live).await?;
            restore_version(layout).await?;
            BootOutcome::Restored
        }
        (false, true) => {
            remove_if_exists(&layout.version_backup).await?;
            BootOutcome::Clean
        }
        (false, false) => {
            remove_if_exists(&layout.version_backup).await?;
            warn!("no application image at {}", layout.live.display());
            BootOutcome::Missing
        }
    };
    Ok(outcome)
}

/// Moves the saved version manifest back into place, returning whether one was saved.
async fn restore_version(layout: &UpdateLayout) -> io::Result<bool> {
    if !exists(&layout.version_backup).await? {
        return Ok(false);
    }
    tokio::fs::rename(&layout.version_backup, &layout.version).await?;
    info!("restored version manifest {}", layout.version.display());
    Ok(true)
}

/// [`verify_boot`], restarting the device when a rollback happened.
pub async fn run_boot_check(
    layout: &UpdateLayout,
    validator: &impl Validator,
    restart: &Arc<RestartCoordinator>,
) -> io::Result<BootOutcome> {
    let outcome = verify_boot(layout, validator).await?;
    if let BootOutcome::RolledBack { reason } = &outcome {
        restart
            .restart(RestartReason::Fault(Fault::CorruptState(reason.clone())))
            .await;
    }
    Ok(outcome)
}
