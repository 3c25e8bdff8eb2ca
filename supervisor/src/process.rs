use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{registry::Registry, supervisor::Supervisor};

pub type ProcessFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// Produces a fresh instance of a logical process. Captures its configuration once at startup.
pub type Launcher = Arc<dyn Fn(ProcessCtx) -> ProcessFuture + Send + Sync>;

pub fn launcher<F, Fut>(f: F) -> Launcher
where
    F: Fn(ProcessCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Handed to every process on launch.
#[derive(Clone)]
pub struct ProcessCtx {
    name: Arc<str>,
    cancel: CancellationToken,
    supervisor: Arc<Supervisor>,
}

impl ProcessCtx {
    pub(crate) fn new(name: &str, cancel: CancellationToken, supervisor: Arc<Supervisor>) -> Self {
        Self {
            name: Arc::from(name),
            cancel,
            supervisor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports forward progress to the health monitor.
    pub fn feed(&self) -> bool {
        self.supervisor.registry().feed_health(&self.name)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Sleeps for `duration`, returning false if cancelled first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.supervisor.registry()
    }
}

/// Static map from process name to its launcher, built once at boot.
#[derive(Clone, Default)]
pub struct DispatchTable {
    launchers: BTreeMap<String, Launcher>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, launcher: Launcher) -> Self {
        self.insert(name, launcher);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, launcher: Launcher) {
        self.launchers.insert(name.into(), launcher);
    }

    pub fn get(&self, name: &str) -> Option<Launcher> {
        self.launchers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.launchers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.launchers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
