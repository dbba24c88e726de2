mod booking;
mod conflict;
mod entitlement;
mod error;
mod ledger;
mod queries;
mod store;

pub use error::EngineError;
pub use store::{DocumentStore, SharedDoc, Versioned};

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
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
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The consistency core of one tenant: versioned documents in memory, every
/// committed mutation WAL-logged first, change events fanned out per account
/// and per resource channel.
pub struct Engine {
    pub store: DocumentStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: DocumentStore::new(),
            wal_tx,
            notify,
        };
        for event in &events {
            engine.store.apply_replay(event);
        }
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Run one optimistic commit attempt repeatedly until it sticks, a real
    /// error surfaces, or attempts run out. Exhaustion maps to `exhausted`
    /// (LedgerUnavailable / BookingUnavailable), which callers may retry.
    pub(super) async fn retry_commit<T, F, Fut>(
        &self,
        exhausted: EngineError,
        op: F,
    ) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Err(EngineError::WriteConflict) => {
                    metrics::counter!(crate::observability::WRITE_CONFLICTS_TOTAL).increment(1);
                    attempt += 1;
                    if attempt >= crate::limits::COMMIT_ATTEMPTS {
                        metrics::counter!(crate::observability::COMMIT_RETRIES_EXHAUSTED_TOTAL)
                            .increment(1);
                        return Err(exhausted);
                    }
                    tokio::time::sleep(Duration::from_millis(
                        crate::limits::COMMIT_BACKOFF_MS * attempt as u64,
                    ))
                    .await;
                }
                other => return other,
            }
        }
    }

    /// Single-document conditional write: lock, re-check the version seen at
    /// snapshot time, WAL-append, apply, bump. The guard is held across the
    /// append so no other writer can slip between the check and the apply.
    pub(super) async fn commit_doc<T, R>(
        &self,
        doc: &SharedDoc<T>,
        expected_version: u64,
        event: &Event,
        mutate: impl FnOnce(&mut T) -> R,
    ) -> Result<R, EngineError> {
        let mut guard = doc.write().await;
        if guard.version != expected_version {
            return Err(EngineError::WriteConflict);
        }
        self.wal_append(event).await?;
        let out = mutate(&mut guard.value);
        guard.version += 1;
        Ok(out)
    }

    /// Rebuild the WAL from a snapshot of current state and swap it in.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let events = self.snapshot_events().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
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

    /// Minimal event sequence that recreates current state on replay.
    ///
    /// Ledger chains are re-emitted entry by entry — the audit trail is the
    /// point of the ledger, so compaction never folds entries away. The
    /// savings come from booking churn: every session collapses to one
    /// `SessionLogged` and cancelled slot movements disappear.
    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for account_id in self.store.account_ids() {
            let Some(doc) = self.store.account(&account_id) else {
                continue;
            };
            let guard = doc.read().await;
            events.push(Event::AccountOpened {
                id: guard.value.id,
                opened_at: guard.value.opened_at,
            });
            for tx in &guard.value.payments {
                events.push(Event::PaymentRecorded {
                    account_id,
                    tx: tx.clone(),
                });
            }
            for entry in &guard.value.entries {
                events.push(Event::LedgerAppended { entry: entry.clone() });
            }
            let sub_ids = self.store.subscription_ids_of(&account_id);
            for sub_id in sub_ids {
                if let Some(sub_doc) = self.store.subscription(&sub_id) {
                    let sub_guard = sub_doc.read().await;
                    events.push(Event::SubscriptionGranted {
                        sub: sub_guard.value.clone(),
                    });
                }
            }
            let session_ids = self.store.session_ids_of(&account_id);
            for session_id in session_ids {
                if let Some(session_doc) = self.store.session(&session_id) {
                    let session_guard = session_doc.read().await;
                    events.push(Event::SessionLogged {
                        session: session_guard.value.clone(),
                    });
                }
            }
        }
        events
    }
}

/// Version check for multi-document commits that hold several guards at once.
pub(super) fn check_version<T>(guard: &Versioned<T>, expected: u64) -> Result<(), EngineError> {
    if guard.version != expected {
        return Err(EngineError::WriteConflict);
    }
    Ok(())
}
