use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::timefmt;

/// Unix milliseconds.
pub type Ms = i64;

/// A calendar event mirrored from the calendar provider.
///
/// The provider sets exactly one of the two starts: `start_date_time` for
/// timed events, `start_date` for all-day ones. Events carrying neither are
/// kept but never block anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: Ulid,
    pub start_date_time: Option<String>,
    pub start_date: Option<String>,
}

impl CalendarEvent {
    pub fn timed(id: Ulid, start_date_time: impl Into<String>) -> Self {
        Self {
            id,
            start_date_time: Some(start_date_time.into()),
            start_date: None,
        }
    }

    pub fn all_day(id: Ulid, start_date: impl Into<String>) -> Self {
        Self {
            id,
            start_date_time: None,
            start_date: Some(start_date.into()),
        }
    }

    /// The start the resolver reads: date-time wins over date.
    pub fn start(&self) -> Option<&str> {
        self.start_date_time
            .as_deref()
            .or(self.start_date.as_deref())
    }

    /// `YYYY-MM-DD` of the start, if any.
    pub fn date(&self) -> Option<&str> {
        self.start().and_then(timefmt::date_part)
    }

    /// Build from the provider's event JSON (`{"start": {"dateTime": ..}}` or
    /// `{"start": {"date": ..}}`). Unknown fields are ignored.
    pub fn from_provider_json(id: Ulid, payload: &str) -> Result<Self, serde_json::Error> {
        let parsed: ProviderEvent = serde_json::from_str(payload)?;
        let start = parsed.start.unwrap_or_default();
        Ok(Self {
            id,
            start_date_time: start.date_time,
            start_date: start.date,
        })
    }
}

#[derive(Deserialize)]
struct ProviderEvent {
    start: Option<ProviderStart>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderStart {
    date_time: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKind {
    Quote,
    Invoice,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 2] = [DocumentKind::Quote, DocumentKind::Invoice];

    /// SQL table name.
    pub fn table(&self) -> &'static str {
        match self {
            DocumentKind::Quote => "quotes",
            DocumentKind::Invoice => "invoices",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DocumentKind::Quote => "quote",
            DocumentKind::Invoice => "invoice",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.table() == table)
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.label() == label || k.table() == label)
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// `PREFIX-YYYY-NNN`. The sequence is padded to three digits and simply grows
/// wider past 999.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentNumber {
    pub prefix: String,
    pub year: i32,
    pub sequence: u32,
}

impl DocumentNumber {
    pub fn new(prefix: impl Into<String>, year: i32, sequence: u32) -> Self {
        Self {
            prefix: prefix.into(),
            year,
            sequence,
        }
    }

    /// `PREFIX-YYYY-`: the part shared by every number of one series.
    pub fn series(prefix: &str, year: i32) -> String {
        format!("{prefix}-{year}-")
    }

    /// Sequence of a stored number: the third `-`-separated segment.
    pub fn sequence_of(number: &str) -> Option<u32> {
        number.split('-').nth(2)?.parse().ok()
    }

    pub fn parse(number: &str) -> Option<Self> {
        let mut parts = number.split('-');
        let prefix = parts.next().filter(|p| !p.is_empty())?;
        let year = parts.next()?.parse().ok()?;
        let sequence = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(prefix, year, sequence))
    }
}

impl fmt::Display for DocumentNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.prefix,
            self.year,
            timefmt::zero_pad(self.sequence, 3)
        )
    }
}

/// A quote or invoice. Deleted documents stay as tombstones so their number
/// is never handed out again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Ulid,
    pub kind: DocumentKind,
    pub number: DocumentNumber,
    pub client: Option<String>,
    pub created_at: Ms,
    pub deleted: bool,
}

/// Journal record. Flat on purpose: replaying these in order rebuilds a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CalendarEventUpserted { event: CalendarEvent },
    CalendarEventRemoved { id: Ulid },
    DocumentIssued { document: Document },
    DocumentDeleted { id: Ulid },
}
