use thiserror::Error;

/// Failure taxonomy shared by the monitors, the watchdog and the updater.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("transient i/o error in {process}: {detail}")]
    TransientIo { process: String, detail: String },
    #[error("update rejected: {0}")]
    Validation(String),
    #[error("process `{name}` silent for {age_ms}ms (threshold {threshold_ms}ms)")]
    Staleness {
        name: String,
        age_ms: u64,
        threshold_ms: u64,
    },
    #[error("process `{name}` exited abnormally: {detail}")]
    Crash { name: String, detail: String },
    #[error("supervisory loop silent for {0}ms")]
    WatchdogTimeout(u64),
    #[error("live image failed validation at boot: {0}")]
    CorruptState(String),
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("network error: {0}")]
    Network(String),
    #[error("http status {status} fetching `{path}`")]
    Http { status: u16, path: String },
    #[error("invalid version manifest: {0}")]
    Version(String),
    #[error("staged image rejected: {0}")]
    Validation(String),
    #[error("previous update is still awaiting confirmation")]
    PendingConfirmation,
    #[error("update check already in progress")]
    Busy,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// The fault a failed update check is reported as, if it is one.
    pub fn fault(&self) -> Option<Fault> {
        match self {
            Self::Validation(reason) => Some(Fault::Validation(reason.clone())),
            _ => None,
        }
    }
}
