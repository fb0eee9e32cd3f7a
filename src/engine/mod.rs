pub mod availability;
mod error;
mod mutations;
pub mod numbering;
mod queries;
mod store;

pub use availability::{busy_slots, open_slots, target_date, SlotGrid};
pub use error::{AllocError, EngineError, StoreError};
pub use numbering::{
    Clock, DocumentStore, FixedYear, NumberAllocator, Prefixes, SystemClock,
};
pub use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::journal::Journal;
use crate::model::*;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
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

/// Owns the journal and batches appends: take the first append, drain
/// whatever else is already queued, then one fsync for the lot.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            JournalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut journal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(JournalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut journal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut journal, cmd);
        }
    }
}

fn commit_batch(journal: &mut Journal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| journal.append_buffered(event));
    // Flush even after a failed append so stray bytes don't leak into the
    // next batch.
    let flushed = journal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result = Journal::write_compact_file(journal.path(), &events)
                .and_then(|()| journal.swap_compact_file());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Engine ───────────────────────────────────────────────

/// Per-tenant knobs.
#[derive(Clone)]
pub struct EngineSettings {
    pub prefixes: Prefixes,
    pub grid: SlotGrid,
    pub clock: Arc<dyn Clock>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            prefixes: Prefixes::default(),
            grid: SlotGrid::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

/// One tenant: calendar mirror and document register over a journal.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) journal_tx: mpsc::Sender<JournalCommand>,
    pub(super) allocator: NumberAllocator,
    pub(super) grid: SlotGrid,
    /// Serialises number claims: allocate + insert run under it, so two
    /// issuers on this engine can't be handed the same number.
    pub(super) issue_lock: Mutex<()>,
    /// Mutations hold it shared; compaction holds it exclusively so the
    /// snapshot and the journal swap see the same state.
    pub(super) write_gate: RwLock<()>,
}

impl Engine {
    pub fn new(journal_path: PathBuf, settings: EngineSettings) -> io::Result<Self> {
        let events = Journal::recover(&journal_path)?;
        let journal = Journal::open(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let store = InMemoryStore::new();
        for event in &events {
            store.apply_event(event);
        }
        tracing::debug!(
            "replayed {} events from {} ({} calendar events, {} documents)",
            events.len(),
            journal_path.display(),
            store.calendar_len(),
            store.document_count()
        );

        Ok(Self {
            store,
            journal_tx,
            allocator: NumberAllocator::new(settings.prefixes, settings.clock),
            grid: settings.grid,
            issue_lock: Mutex::new(()),
            write_gate: RwLock::new(()),
        })
    }

    /// Write event to the journal via the group-commit writer.
    async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))
    }

    /// Journal, then apply to memory.
    pub(super) async fn persist_and_apply(&self, event: &Event) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        self.journal_append(event).await?;
        self.store.apply_event(event);
        Ok(())
    }

    pub fn allocator(&self) -> &NumberAllocator {
        &self.allocator
    }

    pub fn slot_grid(&self) -> SlotGrid {
        self.grid
    }

    pub async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))
    }

    /// Rewrite the journal as a snapshot of the current state.
    pub async fn compact(&self) -> Result<usize, EngineError> {
        let _gate = self.write_gate.write().await;
        let events = self.store.snapshot();
        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))?;
        Ok(count)
    }
}
