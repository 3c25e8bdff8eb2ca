use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::UpdateError;

/// Opaque version identifier, compared by equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Contents of the version artifact, both remote and persisted locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
    pub version: VersionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl VersionManifest {
    pub fn parse(raw: &[u8]) -> Result<Self, UpdateError> {
        let manifest: Self =
            serde_json::from_slice(raw).map_err(|err| UpdateError::Version(err.to_string()))?;
        if manifest.version.as_str().trim().is_empty() {
            return Err(UpdateError::Version("empty version".to_string()));
        }
        if let Some(sha) = &manifest.sha256 {
            if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(UpdateError::Version(
                    "sha256 must be 64 hex characters".to_string(),
                ));
            }
        }
        Ok(manifest)
    }
}

/// Reads the persisted version. `None` when the file is missing or unreadable.
pub async fn read_local_version(path: &Path) -> Option<VersionId> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!("failed to read {}: {err}", path.display());
            return None;
        }
    };
    match VersionManifest::parse(&raw) {
        Ok(manifest) => Some(manifest.version),
        Err(err) => {
            warn!("local version file is corrupt: {err}");
            None
        }
    }
}
