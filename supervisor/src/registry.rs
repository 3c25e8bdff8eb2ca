use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use serde::Serialize;
use tokio::{
    task::{AbortHandle, JoinHandle},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exclusive ownership of one running process.
#[derive(Debug)]
pub struct ProcessHandle {
    join: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ProcessHandle {
    pub fn new(join: JoinHandle<()>, cancel: CancellationToken) -> Self {
        Self { join, cancel }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            token: self.cancel.clone(),
            abort: self.join.abort_handle(),
        }
    }

    pub fn into_join(self) -> JoinHandle<()> {
        self.join
    }

    fn abort_now(&self) {
        self.cancel.cancel();
        self.join.abort();
    }
}

/// Cancels a process without holding on to its registry entry.
#[derive(Debug, Clone)]
pub struct Canceller {
    token: CancellationToken,
    abort: AbortHandle,
}

impl Canceller {
    /// Signals the token, gives the process one yield to clean up, then aborts it.
    /// Safe to call any number of times.
    pub async fn cancel(&self) {
        self.token.cancel();
        tokio::task::yield_now().await;
        self.abort.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub name: String,
    pub status: ProcessStatus,
    pub started_at: Instant,
    pub last_health: Instant,
}

#[derive(Debug)]
struct Entry {
    handle: ProcessHandle,
    started_at: Instant,
    last_health: Instant,
}

/// Name-keyed process table shared by every supervision component.
///
/// The lock is only ever held for plain map operations, never across an await.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<BTreeMap<String, Entry>>,
    restarted: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `handle` under `name`. An existing entry is cancelled and replaced.
    pub fn register(&self, name: impl Into<String>, handle: ProcessHandle) {
        let name = name.into();
        let now = Instant::now();
        let entry = Entry {
            handle,
            started_at: now,
            last_health: now,
        };
        if let Some(previous) = self.table().insert(name.clone(), entry) {
            warn!("process {name} re-registered, cancelling previous instance");
            previous.handle.abort_now();
        }
    }

    /// Refreshes `last_health` for `name`. Unknown names are ignored and return false.
    pub fn feed_health(&self, name: &str) -> bool {
        let now = Instant::now();
        match self.table().get_mut(name) {
            Some(entry) => {
                entry.last_health = entry.last_health.max(now);
                true
            }
            None => {
                debug!("health feed for unregistered process {name} ignored");
                false
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<ProcessHandle> {
        self.table().remove(name).map(|entry| entry.handle)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table().contains_key(name)
    }

    pub fn canceller(&self, name: &str) -> Option<Canceller> {
        self.table().get(name).map(|entry| entry.handle.canceller())
    }

    /// Cancels `name` in place; the entry stays until a liveness sweep collects it.
    pub async fn cancel(&self, name: &str) -> bool {
        let Some(canceller) = self.canceller(name) else {
            return false;
        };
        canceller.cancel().await;
        true
    }

    pub fn last_health(&self, name: &str) -> Option<Instant> {
        self.table().get(name).map(|entry| entry.last_health)
    }

    pub fn started_at(&self, name: &str) -> Option<Instant> {
        self.table().get(name).map(|entry| entry.started_at)
    }

    pub fn snapshot(&self) -> Vec<ProcessSnapshot> {
        self.table()
            .iter()
            .map(|(name, entry)| ProcessSnapshot {
                name: name.clone(),
                status: if entry.handle.is_finished() {
                    ProcessStatus::Finished
                } else {
                    ProcessStatus::Running
                },
                started_at: entry.started_at,
                last_health: entry.last_health,
            })
            .collect()
    }

    pub fn finished_names(&self) -> Vec<String> {
        self.table()
            .iter()
            .filter(|(_, entry)| entry.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Returns `(running, total)`.
    pub fn running_count(&self) -> (usize, usize) {
        let table = self.table();
        let running = table
            .values()
            .filter(|entry| !entry.handle.is_finished())
            .count();
        (running, table.len())
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Empties the table, handing every handle to the caller.
    pub fn drain(&self) -> Vec<(String, ProcessHandle)> {
        let table = std::mem::take(&mut *self.table());
        table
            .into_iter()
            .map(|(name, entry)| (name, entry.handle))
            .collect()
    }

    pub fn note_restart(&self) -> u64 {
        self.restarted.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn restarted_count(&self) -> u64 {
        self.restarted.load(Ordering::Relaxed)
    }
}
