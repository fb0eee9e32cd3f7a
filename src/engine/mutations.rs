use async_trait::async_trait;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{DocumentStore, Engine, EngineError, StoreError};

impl Engine {
    // ── Calendar mirror ──────────────────────────────────────

    /// Mirror events from the calendar provider. Existing ids are replaced.
    pub async fn upsert_calendar_events(
        &self,
        events: Vec<CalendarEvent>,
    ) -> Result<usize, EngineError> {
        if events.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let new_ids = events
            .iter()
            .filter(|e| !self.store.contains_calendar_event(&e.id))
            .count();
        if self.store.calendar_len() + new_ids > MAX_CALENDAR_EVENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many calendar events"));
        }
        for event in &events {
            let too_long = [&event.start_date_time, &event.start_date]
                .into_iter()
                .flatten()
                .any(|s| s.len() > MAX_START_LEN);
            if too_long {
                return Err(EngineError::LimitExceeded("calendar start too long"));
            }
        }

        let count = events.len();
        for event in events {
            self.persist_and_apply(&Event::CalendarEventUpserted { event })
                .await?;
        }
        Ok(count)
    }

    pub async fn remove_calendar_event(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.store.contains_calendar_event(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(&Event::CalendarEventRemoved { id })
            .await
    }

    /// Drop mirrored events dated before `cutoff` (`YYYY-MM-DD`).
    pub async fn prune_calendar_before(&self, cutoff: &str) -> Result<usize, EngineError> {
        let stale = self.store.calendar_before(cutoff);
        for id in &stale {
            self.persist_and_apply(&Event::CalendarEventRemoved { id: *id })
                .await?;
        }
        Ok(stale.len())
    }

    // ── Documents ────────────────────────────────────────────

    /// Claim the next number for `kind` and record the document, atomically
    /// with respect to every other issuer on this engine.
    pub async fn issue_document(
        &self,
        kind: DocumentKind,
        id: Ulid,
        client: Option<String>,
    ) -> Result<Document, EngineError> {
        if let Some(c) = &client
            && c.len() > MAX_CLIENT_LEN {
                return Err(EngineError::LimitExceeded("client name too long"));
            }

        let _claim = self.issue_lock.lock().await;
        let number = self.allocator.allocate(self, kind).await?;
        let document = Document {
            id,
            kind,
            number,
            client,
            created_at: self.allocator.clock().now_ms(),
            deleted: false,
        };
        self.insert_unclaimed(document.clone()).await?;
        info!("issued {kind} {} ({id})", document.number);
        Ok(document)
    }

    /// Tombstone a document. Its number stays taken.
    pub async fn delete_document(&self, kind: DocumentKind, id: Ulid) -> Result<Document, EngineError> {
        let doc = self
            .store
            .get_document(&id)
            .filter(|d| d.kind == kind && !d.deleted)
            .ok_or(EngineError::NotFound(id))?;
        self.persist_and_apply(&Event::DocumentDeleted { id }).await?;
        info!("deleted {kind} {} ({id})", doc.number);
        Ok(Document {
            deleted: true,
            ..doc
        })
    }

    /// Validate against the unique indexes and journal. Callers hold
    /// `issue_lock`.
    async fn insert_unclaimed(&self, document: Document) -> Result<(), StoreError> {
        if self.store.document_count() >= MAX_DOCUMENTS_PER_TENANT {
            return Err(StoreError::LimitExceeded("too many documents"));
        }
        if self.store.get_document(&document.id).is_some() {
            return Err(StoreError::DuplicateId(document.id));
        }
        let number = document.number.to_string();
        if self.store.contains_number(&number) {
            return Err(StoreError::DuplicateNumber(number));
        }
        self.persist_and_apply(&Event::DocumentIssued { document })
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl DocumentStore for Engine {
    async fn latest_number(&self, prefix: &str, year: i32) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .latest_in_series(&DocumentNumber::series(prefix, year)))
    }

    async fn number_exists(&self, number: &str) -> Result<bool, StoreError> {
        Ok(self.store.contains_number(number))
    }

    async fn insert_document(&self, document: Document) -> Result<(), StoreError> {
        let _claim = self.issue_lock.lock().await;
        self.insert_unclaimed(document).await
    }
}
