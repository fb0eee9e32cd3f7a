use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// In-memory state of one tenant, rebuilt from the journal on start.
pub struct InMemoryStore {
    calendar: DashMap<Ulid, CalendarEvent>,
    documents: DashMap<Ulid, Document>,
    /// Unique index on the number column. Tombstones keep their entry.
    numbers: DashMap<String, Ulid>,
    /// `PREFIX-YYYY-` → document ids in creation order (latest last).
    series: DashMap<String, Vec<Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            calendar: DashMap::new(),
            documents: DashMap::new(),
            numbers: DashMap::new(),
            series: DashMap::new(),
        }
    }

    // ── Calendar mirror ──────────────────────────────────────

    pub fn calendar_len(&self) -> usize {
        self.calendar.len()
    }

    pub fn contains_calendar_event(&self, id: &Ulid) -> bool {
        self.calendar.contains_key(id)
    }

    /// All mirrored events ordered by start, then id. Events with no start
    /// sort first.
    pub fn calendar_events(&self) -> Vec<CalendarEvent> {
        let mut events: Vec<CalendarEvent> =
            self.calendar.iter().map(|e| e.value().clone()).collect();
        events.sort_by(|a, b| a.start().cmp(&b.start()).then(a.id.cmp(&b.id)));
        events
    }

    /// Ids of events dated strictly before `cutoff` (`YYYY-MM-DD`).
    pub fn calendar_before(&self, cutoff: &str) -> Vec<Ulid> {
        self.calendar
            .iter()
            .filter(|e| e.value().date().is_some_and(|d| d < cutoff))
            .map(|e| *e.key())
            .collect()
    }

    // ── Documents ────────────────────────────────────────────

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn get_document(&self, id: &Ulid) -> Option<Document> {
        self.documents.get(id).map(|e| e.value().clone())
    }

    pub fn contains_number(&self, number: &str) -> bool {
        self.numbers.contains_key(number)
    }

    pub fn latest_in_series(&self, series: &str) -> Option<String> {
        let ids = self.series.get(series)?;
        let latest = ids.last()?;
        self.documents.get(latest).map(|d| d.number.to_string())
    }

    /// Live documents of `kind`, oldest first, optionally one year only.
    pub fn documents(&self, kind: DocumentKind, year: Option<i32>) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .documents
            .iter()
            .filter(|e| {
                let d = e.value();
                d.kind == kind && !d.deleted && year.is_none_or(|y| d.number.year == y)
            })
            .map(|e| e.value().clone())
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        docs
    }

    // ── Snapshot ─────────────────────────────────────────────

    /// Minimal event list that rebuilds the current state, tombstones
    /// included so their numbers stay taken.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .calendar_events()
            .into_iter()
            .map(|event| Event::CalendarEventUpserted { event })
            .collect();
        for series in self.series.iter() {
            for id in series.value() {
                if let Some(document) = self.get_document(id) {
                    events.push(Event::DocumentIssued { document });
                }
            }
        }
        events
    }

    // ── Event application ────────────────────────────────────

    /// Apply a journaled event. Callers validate before journaling, so this
    /// never fails.
    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::CalendarEventUpserted { event } => {
                self.calendar.insert(event.id, event.clone());
            }
            Event::CalendarEventRemoved { id } => {
                self.calendar.remove(id);
            }
            Event::DocumentIssued { document } => {
                let number = document.number.to_string();
                let series = DocumentNumber::series(&document.number.prefix, document.number.year);
                self.numbers.insert(number, document.id);
                self.series.entry(series).or_default().push(document.id);
                self.documents.insert(document.id, document.clone());
            }
            Event::DocumentDeleted { id } => {
                if let Some(mut doc) = self.documents.get_mut(id) {
                    doc.deleted = true;
                }
            }
        }
    }
}
