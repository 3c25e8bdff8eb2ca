use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use super::{
    boot::BootOutcome,
    image::{sha256_hex, Validation, Validator},
    layout::{exists, remove_if_exists, UpdateLayout},
    remote::RemoteSource,
    version::{read_local_version, VersionId, VersionManifest},
};
use crate::{
    error::UpdateError,
    restart::{RestartCoordinator, RestartReason},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePhase {
    #[default]
    Idle,
    Fetched,
    Staged,
    Validated,
    Swapped,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    pub phase: UpdatePhase,
    pub in_progress: bool,
    pub local_version: Option<String>,
    pub remote_version: Option<String>,
    pub bytes_staged: u64,
    pub staged_sha256: Option<String>,
    pub last_error: Option<String>,
    pub last_completed_epoch: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate(VersionId),
    Applied {
        from: Option<VersionId>,
        to: VersionId,
    },
}

/// Owns the update transaction: fetch, stage, validate, swap, restart.
pub struct UpdateManager<R, V> {
    remote: R,
    validator: V,
    layout: UpdateLayout,
    app_path: String,
    version_path: String,
    restart: Arc<RestartCoordinator>,
    status: Mutex<UpdateStatus>,
    busy: tokio::sync::Mutex<()>,
}

impl<R: RemoteSource, V: Validator> UpdateManager<R, V> {
    pub fn new(
        remote: R,
        validator: V,
        layout: UpdateLayout,
        restart: Arc<RestartCoordinator>,
    ) -> Self {
        Self {
            remote,
            validator,
            layout,
            app_path: "app.img".to_string(),
            version_path: "version.json".to_string(),
            restart,
            status: Mutex::new(UpdateStatus::default()),
            busy: tokio::sync::Mutex::new(()),
        }
    }

    /// Remote paths of the application image and the version manifest.
    pub fn with_remote_paths(mut self, app_path: &str, version_path: &str) -> Self {
        self.app_path = app_path.to_string();
        self.version_path = version_path.to_string();
        self
    }

    pub fn layout(&self) -> &UpdateLayout {
        &self.layout
    }

    pub fn status(&self) -> UpdateStatus {
        self.state().clone()
    }

    fn state(&self) -> MutexGuard<'_, UpdateStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: UpdatePhase) {
        self.state().phase = phase;
    }

    /// Folds the result of this boot's integrity check into the status.
    pub fn record_boot(&self, outcome: &BootOutcome) {
        let mut state = self.state();
        match outcome {
            BootOutcome::Confirmed => state.phase = UpdatePhase::Confirmed,
            BootOutcome::RolledBack { reason } => {
                state.phase = UpdatePhase::Rejected;
                state.last_error = Some(format!("rolled back at boot: {reason}"));
            }
            _ => {}
        }
    }

    pub async fn get_local_version(&self) -> Option<VersionId> {
        read_local_version(&self.layout.version).await
    }

    pub async fn fetch_remote_version(&self) -> Result<VersionId, UpdateError> {
        let (manifest, _) = self.fetch_manifest().await?;
        Ok(manifest.version)
    }

    async fn fetch_manifest(&self) -> Result<(VersionManifest, Vec<u8>), UpdateError> {
        let raw = self.remote.fetch(&self.version_path).await?;
        let manifest = VersionManifest::parse(&raw)?;
        Ok((manifest, raw))
    }

    /// Applies the remote version when it differs from the local one.
    ///
    /// Every failure leaves the live image and version file as they were. A successful
    /// swap ends in a device restart.
    pub async fn ota_check(&self) -> Result<UpdateOutcome, UpdateError> {
        let Ok(_guard) = self.busy.try_lock() else {
            return Err(UpdateError::Busy);
        };
        {
            let mut state = self.state();
            state.in_progress = true;
            state.last_error = None;
            state.phase = UpdatePhase::Idle;
        }

        let result = self.run_check().await;

        let mut state = self.state();
        state.in_progress = false;
        state.last_completed_epoch = Some(Utc::now().timestamp());
        if let Err(err) = &result {
            state.last_error = Some(err.to_string());
        }
        result
    }

    async fn run_check(&self) -> Result<UpdateOutcome, UpdateError> {
        let local = self.get_local_version().await;
        self.state().local_version = local.as_ref().map(|v| v.to_string());

        let (manifest, raw_manifest) = self.fetch_manifest().await?;
        {
            let mut state = self.state();
            state.phase = UpdatePhase::Fetched;
            state.remote_version = Some(manifest.version.to_string());
        }

        if local.as_ref() == Some(&manifest.version) {
            info!("firmware {} is up to date", manifest.version);
            self.set_phase(UpdatePhase::Idle);
            return Ok(UpdateOutcome::UpToDate(manifest.version));
        }
        if exists(&self.layout.backup).await? {
            return Err(UpdateError::PendingConfirmation);
        }
        info!(
            "updating firmware {} -> {}",
            local.as_ref().map_or("unknown", VersionId::as_str),
            manifest.version
        );

        if let Err(err) = self.stage_and_validate(&manifest).await {
            if let Err(cleanup) = remove_if_exists(&self.layout.staging).await {
                warn!("failed to remove staged image: {cleanup}");
            }
            self.set_phase(UpdatePhase::Rejected);
            match err.fault() {
                Some(fault) => warn!("{fault} (firmware {})", manifest.version),
                None => warn!("update to {} aborted: {err}", manifest.version),
            }
            return Err(err);
        }

        self.swap().await?;
        self.set_phase(UpdatePhase::Swapped);
        tokio::fs::write(&self.layout.version, &raw_manifest).await?;
        info!("firmware {} installed, restarting", manifest.version);

        self.restart
            .restart(RestartReason::UpdateApplied {
                version: manifest.version.to_string(),
            })
            .await;

        Ok(UpdateOutcome::Applied {
            from: local,
            to: manifest.version,
        })
    }

    async fn stage_and_validate(&self, manifest: &VersionManifest) -> Result<(), UpdateError> {
        let staging = &self.layout.staging;
        let written = self.remote.download(&self.app_path, staging).await?;
        let payload = tokio::fs::read(staging).await?;
        let digest = sha256_hex(&payload);
        {
            let mut state = self.state();
            state.phase = UpdatePhase::Staged;
            state.bytes_staged = written;
            state.staged_sha256 = Some(digest.clone());
        }

        if let Some(expected) = &manifest.sha256 {
            let expected = expected.trim().to_ascii_lowercase();
            if digest != expected {
                return Err(UpdateError::Validation(format!(
                    "sha256 mismatch (expected {expected}, got {digest})"
                )));
            }
        }
        if let Validation::Invalid(reason) = self.validator.validate(&payload) {
            return Err(UpdateError::Validation(reason));
        }
        self.set_phase(UpdatePhase::Validated);
        Ok(())
    }

    /// Live becomes backup before staging becomes live. The current version manifest is
    /// copied aside first so a rollback at boot can put it back.
    async fn swap(&self) -> Result<(), UpdateError> {
        let layout = &self.layout;
        remove_if_exists(&layout.version_backup).await?;
        let backed_up = if exists(&layout.live).await? {
            if exists(&layout.version).await? {
                tokio::fs::copy(&layout.version, &layout.version_backup).await?;
            }
            tokio::fs::rename(&layout.live, &layout.backup).await?;
            true
        } else {
            false
        };

        if let Err(err) = tokio::fs::rename(&layout.staging, &layout.live).await {
            if backed_up {
                if let Err(restore) = tokio::fs::rename(&layout.backup, &layout.live).await {
                    warn!("failed to restore previous image: {restore}");
                }
            }
            if let Err(cleanup) = remove_if_exists(&layout.version_backup).await {
                warn!("failed to remove version backup: {cleanup}");
            }
            self.set_phase(UpdatePhase::Rejected);
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        error::Fault,
        ota::{
            boot::verify_boot,
            image::{encode_image, ImageValidator},
        },
        testutil::{test_coordinator, RecordingDevice},
    };

    struct FakeRemote {
        manifest: Option<Vec<u8>>,
        image: Result<Vec<u8>, u16>,
        downloads: AtomicUsize,
    }

    impl FakeRemote {
        fn serving(version: &str, image: Vec<u8>) -> Self {
            Self {
                manifest: Some(manifest(version)),
                image: Ok(image),
                downloads: AtomicUsize::new(0),
            }
        }
    }

    impl RemoteSource for FakeRemote {
        async fn fetch(&self, path: &str) -> Result<Vec<u8>, UpdateError> {
            assert_eq!(path, "version.json");
            self.manifest
                .clone()
                .ok_or_else(|| UpdateError::Network("host unreachable".into()))
        }

        async fn download(&self, path: &str, dest: &Path) -> Result<u64, UpdateError> {
            assert_eq!(path, "app.img");
            self.downloads.fetch_add(1, Ordering::SeqCst);
            match &self.image {
                Ok(bytes) => {
                    tokio::fs::write(dest, bytes).await?;
                    Ok(bytes.len() as u64)
                }
                Err(status) => Err(UpdateError::Http {
                    status: *status,
                    path: path.to_string(),
                }),
            }
        }
    }

    fn manifest(version: &str) -> Vec<u8> {
        format!(r#"{{"version":"{version}"}}"#).into_bytes()
    }

    struct Fixture {
        dir: TempDir,
        manager: UpdateManager<FakeRemote, ImageValidator>,
        device: Arc<RecordingDevice>,
    }

    fn fixture(remote: FakeRemote, live: Option<&[u8]>, version: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = UpdateLayout::new(dir.path(), "app.img", "version.json");
        if let Some(live) = live {
            std::fs::write(&layout.live, live).unwrap();
        }
        if let Some(version) = version {
            std::fs::write(&layout.version, manifest(version)).unwrap();
        }
        let (coordinator, device) = test_coordinator();
        let manager = UpdateManager::new(remote, ImageValidator, layout, coordinator);
        Fixture {
            dir,
            manager,
            device,
        }
    }

    fn files(dir: &TempDir) -> BTreeMap<String, Vec<u8>> {
        std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                (
                    entry.file_name().to_string_lossy().into_owned(),
                    std::fs::read(entry.path()).unwrap(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn identical_versions_touch_nothing() {
        let old = encode_image(b"app 1.0.0");
        let fx = fixture(
            FakeRemote::serving("1.0.0", encode_image(b"app 1.0.1")),
            Some(&old),
            Some("1.0.0"),
        );
        let before = files(&fx.dir);

        let outcome = fx.manager.ota_check().await.unwrap();

        assert_eq!(outcome, UpdateOutcome::UpToDate(VersionId::new("1.0.0")));
        assert_eq!(files(&fx.dir), before);
        assert_eq!(fx.manager.remote.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(fx.device.reset_count(), 0);
    }

    #[tokio::test]
    async fn valid_update_is_swapped_in_and_restarts_once() {
        let old = encode_image(b"app 1.0.0");
        let new = encode_image(b"app 1.0.1");
        let fx = fixture(
            FakeRemote::serving("1.0.1", new.clone()),
            Some(&old),
            Some("1.0.0"),
        );

        let outcome = fx.manager.ota_check().await.unwrap();

        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                from: Some(VersionId::new("1.0.0")),
                to: VersionId::new("1.0.1"),
            }
        );
        let layout = fx.manager.layout();
        assert_eq!(std::fs::read(&layout.live).unwrap(), new);
        assert_eq!(std::fs::read(&layout.backup).unwrap(), old);
        assert!(!layout.staging.exists());
        assert_eq!(
            read_local_version(&layout.version).await,
            Some(VersionId::new("1.0.1"))
        );
        assert_eq!(
            std::fs::read(&layout.version_backup).unwrap(),
            manifest("1.0.0")
        );
        assert_eq!(fx.device.reset_count(), 1);

        let status = fx.manager.status();
        assert_eq!(status.phase, UpdatePhase::Swapped);
        assert!(!status.in_progress);
        assert_eq!(status.staged_sha256, Some(sha256_hex(&new)));
    }

    #[tokio::test]
    async fn truncated_payload_is_rejected_without_touching_live() {
        let old = encode_image(b"app 1.0.0");
        let mut new = encode_image(b"app 1.0.1");
        new.truncate(new.len() - 7);
        let fx = fixture(FakeRemote::serving("1.0.1", new), Some(&old), Some("1.0.0"));
        let before = files(&fx.dir);

        let err = fx.manager.ota_check().await.unwrap_err();

        assert!(err.is_validation());
        assert!(matches!(err.fault(), Some(Fault::Validation(_))));
        assert_eq!(files(&fx.dir), before);
        assert!(!fx.manager.layout().staging.exists());
        assert_eq!(fx.device.reset_count(), 0);
        let status = fx.manager.status();
        assert_eq!(status.phase, UpdatePhase::Rejected);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn manifest_digest_must_match_payload() {
        let old = encode_image(b"app 1.0.0");
        let mut remote = FakeRemote::serving("1.0.1", encode_image(b"app 1.0.1"));
        remote.manifest = Some(
            format!(r#"{{"version":"1.0.1","sha256":"{}"}}"#, sha256_hex(b"other")).into_bytes(),
        );
        let fx = fixture(remote, Some(&old), Some("1.0.0"));
        let before = files(&fx.dir);

        let err = fx.manager.ota_check().await.unwrap_err();

        assert!(matches!(err, UpdateError::Validation(reason) if reason.contains("sha256")));
        assert_eq!(files(&fx.dir), before);
    }

    #[tokio::test]
    async fn network_failures_are_recovered_locally() {
        let old = encode_image(b"app 1.0.0");
        let mut remote = FakeRemote::serving("1.0.1", encode_image(b"app 1.0.1"));
        remote.manifest = None;
        let fx = fixture(remote, Some(&old), Some("1.0.0"));
        let before = files(&fx.dir);

        assert!(matches!(
            fx.manager.ota_check().await,
            Err(UpdateError::Network(_))
        ));
        assert_eq!(files(&fx.dir), before);
        assert!(!fx.manager.status().in_progress);
    }

    #[tokio::test]
    async fn http_error_during_download_leaves_no_staging() {
        let old = encode_image(b"app 1.0.0");
        let mut remote = FakeRemote::serving("1.0.1", Vec::new());
        remote.image = Err(404);
        let fx = fixture(remote, Some(&old), Some("1.0.0"));
        let before = files(&fx.dir);

        assert!(matches!(
            fx.manager.ota_check().await,
            Err(UpdateError::Http { status: 404, .. })
        ));
        assert_eq!(files(&fx.dir), before);
    }

    #[tokio::test]
    async fn older_remote_version_still_counts_as_different() {
        let old = encode_image(b"app 1.0.1");
        let fx = fixture(
            FakeRemote::serving("1.0.0", encode_image(b"app 1.0.0")),
            Some(&old),
            Some("1.0.1"),
        );

        let outcome = fx.manager.ota_check().await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied { .. }));
        assert_eq!(fx.device.reset_count(), 1);
    }

    #[tokio::test]
    async fn unknown_local_version_installs_remote() {
        let new = encode_image(b"app 1.0.1");
        let fx = fixture(FakeRemote::serving("1.0.1", new.clone()), None, None);

        let outcome = fx.manager.ota_check().await.unwrap();

        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                from: None,
                to: VersionId::new("1.0.1"),
            }
        );
        let layout = fx.manager.layout();
        assert_eq!(std::fs::read(&layout.live).unwrap(), new);
        assert!(!layout.backup.exists());
    }

    struct AcceptAll;

    impl Validator for AcceptAll {
        fn validate(&self, _payload: &[u8]) -> Validation {
            Validation::Valid
        }
    }

    #[tokio::test]
    async fn rolled_back_update_is_retried_on_next_check() {
        let old = encode_image(b"app 1.0.0");
        let dir = tempfile::tempdir().unwrap();
        let layout = UpdateLayout::new(dir.path(), "app.img", "version.json");
        std::fs::write(&layout.live, &old).unwrap();
        std::fs::write(&layout.version, manifest("1.0.0")).unwrap();

        // A payload that passes staging but fails the boot-time check.
        let (coordinator, _) = test_coordinator();
        let lax = UpdateManager::new(
            FakeRemote::serving("1.0.1", b"FGAP garbage".to_vec()),
            AcceptAll,
            layout.clone(),
            coordinator,
        );
        assert!(matches!(
            lax.ota_check().await,
            Ok(UpdateOutcome::Applied { .. })
        ));

        let outcome = verify_boot(&layout, &ImageValidator).await.unwrap();
        assert!(matches!(outcome, BootOutcome::RolledBack { .. }));
        assert_eq!(std::fs::read(&layout.live).unwrap(), old);
        assert_eq!(
            read_local_version(&layout.version).await,
            Some(VersionId::new("1.0.0"))
        );

        let new = encode_image(b"app 1.0.1");
        let (coordinator, device) = test_coordinator();
        let manager = UpdateManager::new(
            FakeRemote::serving("1.0.1", new.clone()),
            ImageValidator,
            layout.clone(),
            coordinator,
        );
        manager.record_boot(&outcome);

        assert_eq!(
            manager.ota_check().await.unwrap(),
            UpdateOutcome::Applied {
                from: Some(VersionId::new("1.0.0")),
                to: VersionId::new("1.0.1"),
            }
        );
        assert_eq!(std::fs::read(&layout.live).unwrap(), new);
        assert_eq!(manager.remote.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(device.reset_count(), 1);
    }

    #[tokio::test]
    async fn unconfirmed_backup_blocks_another_update() {
        let old = encode_image(b"app 1.0.0");
        let fx = fixture(
            FakeRemote::serving("1.0.1", encode_image(b"app 1.0.1")),
            Some(&old),
            Some("1.0.0"),
        );
        std::fs::write(&fx.manager.layout().backup, &old).unwrap();

        assert!(matches!(
            fx.manager.ota_check().await,
            Err(UpdateError::PendingConfirmation)
        ));
        assert_eq!(fx.device.reset_count(), 0);
    }
}
