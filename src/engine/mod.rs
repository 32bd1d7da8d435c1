mod error;
mod mutations;
mod queries;
mod schedule;
mod store;

pub use error::EngineError;
pub use schedule::{truncate_to_minute, validate_dates};
pub use store::{BookingStore, InMemoryStore};

use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// Write gate for one stage key. `None` is the gate of unstaged events.
pub type StageGate = Arc<Mutex<()>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        mutation: Mutation,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        mutations: Vec<Mutation>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Mutation, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is queued, then one
/// flush + fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { mutation, response } => {
                let mut batch = vec![(mutation, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { mutation, response }) => {
                            batch.push((mutation, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush the batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = wal.commit(batch.iter().map(|(mutation, _)| mutation));
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { mutations, response } => {
            let _ = response.send(wal.rewrite(&mutations));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's schedule: the booking store plus the directory used for the
/// read-side join, the stage write gates and the WAL writer handle.
pub struct Engine {
    pub(super) store: Arc<dyn BookingStore>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) gates: DashMap<Option<Ulid>, StageGate>,
    pub(super) stages: DashMap<Ulid, String>,
    pub(super) talents: DashMap<Ulid, String>,
    /// Ids of creates between admission and commit.
    pub(super) pending_ids: DashSet<Ulid>,
    /// Creates between admission and commit, counted against the event cap.
    pub(super) creates_in_flight: AtomicUsize,
    /// Held shared across append+apply, exclusively while compacting, so a
    /// compaction snapshot never misses an appended-but-unapplied mutation.
    pub(super) commit_lock: RwLock<()>,
}

/// Apply a committed mutation to the store and directory.
fn apply_mutation(
    store: &dyn BookingStore,
    stages: &DashMap<Ulid, String>,
    talents: &DashMap<Ulid, String>,
    mutation: &Mutation,
) {
    match mutation {
        Mutation::EventCreated { record } => {
            store.insert(record.clone());
        }
        Mutation::EventUpdated {
            id,
            patch,
            last_modified,
        } => {
            store.update(id, patch, *last_modified);
        }
        Mutation::EventDeleted { id, last_modified } => {
            store.soft_delete(id, *last_modified);
        }
        Mutation::StageRegistered { id, name } => {
            stages.insert(*id, name.clone());
        }
        Mutation::TalentRegistered { id, name } => {
            talents.insert(*id, name.clone());
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_store(wal_path, notify, Arc::new(InMemoryStore::new()))
    }

    /// Build an engine over an injected store, replaying the WAL into it.
    pub fn with_store(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        store: Arc<dyn BookingStore>,
    ) -> io::Result<Self> {
        let (wal, mutations) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store,
            wal_tx,
            notify,
            gates: DashMap::new(),
            stages: DashMap::new(),
            talents: DashMap::new(),
            pending_ids: DashSet::new(),
            creates_in_flight: AtomicUsize::new(0),
            commit_lock: RwLock::new(()),
        };

        for mutation in &mutations {
            apply_mutation(engine.store.as_ref(), &engine.stages, &engine.talents, mutation);
        }
        tracing::debug!(
            replayed = mutations.len(),
            events = engine.store.len(),
            "engine ready: {}",
            wal_path.display()
        );

        Ok(engine)
    }

    /// Write a mutation to the WAL via the background group-commit writer.
    async fn wal_append(&self, mutation: &Mutation) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                mutation: mutation.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify the affected stages.
    pub(super) async fn persist_and_apply(
        &self,
        mutation: &Mutation,
        stages: &[Option<Ulid>],
    ) -> Result<(), EngineError> {
        {
            let _commit = self.commit_lock.read().await;
            self.wal_append(mutation).await?;
            apply_mutation(self.store.as_ref(), &self.stages, &self.talents, mutation);
        }
        let mut notified: Vec<Ulid> = stages.iter().flatten().copied().collect();
        notified.sort();
        notified.dedup();
        for stage_id in notified {
            self.notify.send(stage_id, mutation);
        }
        Ok(())
    }

    /// Acquire the write gates for the given stage keys in sorted order,
    /// so concurrent multi-gate holders cannot deadlock.
    pub(super) async fn lock_gates(&self, mut keys: Vec<Option<Ulid>>) -> Vec<OwnedMutexGuard<()>> {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let gate = self.gates.entry(key).or_default().value().clone();
            guards.push(gate.lock_owned().await);
        }
        guards
    }

    pub fn store(&self) -> &Arc<dyn BookingStore> {
        &self.store
    }
}
