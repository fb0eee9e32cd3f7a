use ulid::Ulid;

use crate::model::*;

use super::availability::{busy_slots, open_slots};
use super::{Engine, EngineError};

impl Engine {
    /// Busy-slot markers for the day of `raw_date`, over the mirrored calendar.
    pub fn busy_slots(&self, raw_date: &str) -> Vec<String> {
        busy_slots(raw_date, &self.store.calendar_events())
    }

    /// Grid slots not taken on the day of `raw_date`. An unresolvable date
    /// returns the full grid, same as the busy-slot fail-open.
    pub fn open_slots(&self, raw_date: &str) -> Vec<String> {
        open_slots(&self.grid.slots(), &self.busy_slots(raw_date))
    }

    pub fn calendar_events(&self) -> Vec<CalendarEvent> {
        self.store.calendar_events()
    }

    pub fn list_documents(&self, kind: DocumentKind, year: Option<i32>) -> Vec<Document> {
        self.store.documents(kind, year)
    }

    pub fn get_document(&self, id: &Ulid) -> Option<Document> {
        self.store.get_document(id)
    }

    /// The number the next issue would most likely get. Nothing is reserved.
    pub async fn preview_number(&self, kind: DocumentKind) -> Result<DocumentNumber, EngineError> {
        Ok(self.allocator.allocate(self, kind).await?)
    }
}
