mod conflict;
mod directory;
mod error;
mod queries;
mod reservations;
mod session;
mod status;
mod store;

pub use directory::{EquipmentPatch, NewEquipment, ServiceCondition};
pub use error::{EngineError, Violation};
pub use queries::{ReservationFilter, UsageFilter};
pub use reservations::{NewReservation, ReservationPatch};
pub use session::{CartItem, LoanSession, ScanOutcome, SessionView};
pub use status::derived_status;
pub use store::TagOwner;

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::model::*;
use crate::wal::{Commit, Wal};

use session::SessionState;
use store::{Store, UnitGuards};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    Disable {
        response: oneshot::Sender<()>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => {
                            batch.push((commit, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(commit, _)| wal.append_buffered(commit))
        .and_then(|()| wal.flush_sync());
    // Every caller in the batch is told it failed, so none of it may
    // survive in the buffer or the file.
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!("WAL rollback failed, refusing further appends: {e}");
    }
    result
}

fn respond_batch(batch: Vec<(Commit, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::Disable { response } => {
            wal.disable();
            let _ = response.send(());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The equipment lifecycle core: reservation engine, status synchronizer and
/// loan session machine over one WAL-backed store.
pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Every mutation holds this shared; compaction holds it exclusively so
    /// no commit lands between snapshot and swap. Taken before any unit lock.
    pub(super) commit_gate: RwLock<()>,
    /// The single loan-session slot. Held for a whole scan.
    pub(super) session: Mutex<SessionState>,
    pub(super) session_timeout_ms: Ms,
}

impl Engine {
    /// Open the engine on `wal_path`, replaying whatever is there. Must be
    /// called inside a tokio runtime (spawns the WAL writer).
    pub fn new(wal_path: PathBuf, session_timeout: Duration) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            session: Mutex::new(SessionState::Idle),
            session_timeout_ms: session_timeout.as_millis() as Ms,
        };

        // Sole owner of every lock here, so try_write_owned never contends.
        // Never block: this may run inside an async context.
        for commit in &commits {
            let mut guards = UnitGuards::new();
            for event in commit {
                for id in event.unit_ids() {
                    if guards.contains_key(&id) {
                        continue;
                    }
                    let Some(unit) = engine.store.unit(&id) else {
                        continue;
                    };
                    match unit.try_write_owned() {
                        Ok(guard) => {
                            guards.insert(id, guard);
                        }
                        Err(_) => tracing::warn!("replay: unit {id} unexpectedly locked"),
                    }
                }
                engine.store.apply_event(event, &mut guards);
            }
        }
        tracing::info!(
            commits = commits.len(),
            units = engine.store.unit_count(),
            "replayed WAL {}",
            wal_path.display()
        );

        Ok(engine)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms.max(0) as u64)
    }

    /// Write a commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, commit: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit: commit.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Start a mutation. Hold the returned guard until the commit is applied.
    pub(super) async fn begin_write(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    /// WAL-append then apply, all-or-nothing. If the append fails nothing is
    /// applied and the storage error is returned as-is.
    pub(super) async fn commit(&self, commit: Commit, guards: &mut UnitGuards) -> Result<(), EngineError> {
        if commit.is_empty() {
            return Ok(());
        }
        self.wal_append(&commit).await?;
        for event in &commit {
            self.store.apply_event(event, guards);
        }
        Ok(())
    }

    /// Write-lock the given units in ascending id order. Unknown ids are
    /// returned separately.
    pub(super) async fn lock_units(&self, ids: &BTreeSet<Ulid>) -> (UnitGuards, Vec<Ulid>) {
        let mut guards = UnitGuards::new();
        let mut missing = Vec::new();
        for id in ids {
            match self.store.unit(id) {
                Some(unit) => {
                    guards.insert(*id, unit.write_owned().await);
                }
                None => missing.push(*id),
            }
        }
        (guards, missing)
    }

    /// Lookup reservation → unit, then lock that unit.
    pub(super) async fn lock_reservation(&self, reservation_id: Ulid) -> Result<(Ulid, UnitGuards), EngineError> {
        let equipment_id = self
            .store
            .equipment_for_reservation(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let (guards, _) = self.lock_units(&BTreeSet::from([equipment_id])).await;
        // Deleted while we waited for the lock.
        match guards.get(&equipment_id) {
            Some(unit) if unit.reservation(reservation_id).is_some() => Ok((equipment_id, guards)),
            _ => Err(EngineError::NotFound(reservation_id)),
        }
    }

    /// Rewrite the WAL with only the commits needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut commits: Vec<Commit> = Vec::new();
        for user in self.store.users() {
            commits.push(vec![Event::UserUpserted { user }]);
        }
        for event in self.store.calendar_events() {
            commits.push(vec![Event::CalendarEventRegistered { event }]);
        }
        for id in self.store.unit_ids() {
            let Some(unit) = self.store.unit(&id) else {
                continue;
            };
            let guard = unit.read().await;
            let mut commit = vec![Event::EquipmentRegistered { unit: guard.info() }];
            commit.extend(
                guard
                    .reservations
                    .iter()
                    .cloned()
                    .map(|reservation| Event::ReservationCreated { reservation }),
            );
            commits.push(commit);
        }
        let mut logs = self.store.usage_logs();
        logs.sort_by_key(|l| (l.committed_at, l.id));
        for log in logs {
            commits.push(vec![Event::UsageLogged { log }]);
        }
        for pending in self.store.pending_tags() {
            commits.push(vec![Event::PendingTagRecorded { pending }]);
        }

        let count = commits.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { commits, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(commits = count, "compacted WAL");
        Ok(())
    }

    /// Make every later WAL append fail, as after an unrecoverable I/O error.
    #[cfg(test)]
    pub(super) async fn disable_wal(&self) {
        let (tx, rx) = oneshot::channel();
        if self.wal_tx.send(WalCommand::Disable { response: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
