use std::{
    io,
    path::{Path, PathBuf},
};

/// Where the live, staging, backup and version files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateLayout {
    pub live: PathBuf,
    pub staging: PathBuf,
    pub backup: PathBuf,
    pub version: PathBuf,
    /// The version manifest that belongs to `backup`, kept until the swap is settled.
    pub version_backup: PathBuf,
}

impl UpdateLayout {
    pub fn new(dir: impl AsRef<Path>, live_file: &str, version_file: &str) -> Self {
        let dir = dir.as_ref();
        let live = dir.join(live_file);
        let version = dir.join(version_file);
        Self {
            staging: with_suffix(&live, "staging"),
            backup: with_suffix(&live, "backup"),
            version_backup: with_suffix(&version, "backup"),
            version,
            live,
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) async fn exists(path: &Path) -> io::Result<bool> {
    tokio::fs::try_exists(path).await
}

/// Deletes `path`, returning whether there was anything to delete.
pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
