use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Datelike;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;

use super::{AllocError, StoreError};

pub const MAX_ATTEMPTS: u32 = 10;
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

// ── Capabilities ──────────────────────────────────────────────────

/// Source of "now" for numbering.
pub trait Clock: Send + Sync {
    /// Calendar year in process-local time.
    fn current_year(&self) -> i32;

    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current_year(&self) -> i32 {
        chrono::Local::now().year()
    }
}

/// Pins the year; used for back-dated imports and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedYear(pub i32);

impl Clock for FixedYear {
    fn current_year(&self) -> i32 {
        self.0
    }
}

/// What the allocator needs from wherever documents live.
///
/// The store, not the allocator, owns uniqueness: `insert_document` must fail
/// with [`StoreError::DuplicateNumber`] when the number is already held.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Number of the most recently created document in `PREFIX-YEAR-*`.
    async fn latest_number(&self, prefix: &str, year: i32) -> Result<Option<String>, StoreError>;

    async fn number_exists(&self, number: &str) -> Result<bool, StoreError>;

    async fn insert_document(&self, document: Document) -> Result<(), StoreError>;
}

// ── Allocator ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefixes {
    pub quote: String,
    pub invoice: String,
}

impl Default for Prefixes {
    fn default() -> Self {
        Self {
            quote: "ORC".into(),
            invoice: "FAT".into(),
        }
    }
}

impl Prefixes {
    pub fn for_kind(&self, kind: DocumentKind) -> &str {
        match kind {
            DocumentKind::Quote => &self.quote,
            DocumentKind::Invoice => &self.invoice,
        }
    }
}

/// Optimistic `PREFIX-YYYY-NNN` allocation.
///
/// Each attempt samples the latest number of the current year's series,
/// proposes the next one and checks it is free. A taken candidate means a
/// concurrent writer got there first: wait `retry_delay` and sample again,
/// up to `max_attempts` times. Nothing is locked, so a free answer from
/// [`allocate`](Self::allocate) is only advisory until the caller inserts.
pub struct NumberAllocator {
    prefixes: Prefixes,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl NumberAllocator {
    pub fn new(prefixes: Prefixes, clock: Arc<dyn Clock>) -> Self {
        Self {
            prefixes,
            clock,
            max_attempts: MAX_ATTEMPTS,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn prefix(&self, kind: DocumentKind) -> &str {
        self.prefixes.for_kind(kind)
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Find a number that is free right now.
    pub async fn allocate<S>(&self, store: &S, kind: DocumentKind) -> Result<DocumentNumber, AllocError>
    where
        S: DocumentStore + ?Sized,
    {
        for attempt in 1..=self.max_attempts {
            let candidate = self.sample(store, kind).await?;
            if !store.number_exists(&candidate.to_string()).await? {
                metrics::histogram!(crate::observability::ALLOCATION_ATTEMPTS)
                    .record(attempt as f64);
                return Ok(candidate);
            }
            self.collided(&candidate, attempt).await;
        }
        Err(self.exhausted(kind))
    }

    /// Allocate and insert in one go. A [`StoreError::DuplicateNumber`] from
    /// the insert (someone took the number after our existence check) is a
    /// collision like any other and spends one attempt.
    pub async fn issue<S>(
        &self,
        store: &S,
        kind: DocumentKind,
        id: Ulid,
        client: Option<String>,
    ) -> Result<Document, AllocError>
    where
        S: DocumentStore + ?Sized,
    {
        for attempt in 1..=self.max_attempts {
            let candidate = self.sample(store, kind).await?;
            if store.number_exists(&candidate.to_string()).await? {
                self.collided(&candidate, attempt).await;
                continue;
            }
            let document = Document {
                id,
                kind,
                number: candidate.clone(),
                client: client.clone(),
                created_at: self.clock.now_ms(),
                deleted: false,
            };
            match store.insert_document(document.clone()).await {
                Ok(()) => {
                    metrics::histogram!(crate::observability::ALLOCATION_ATTEMPTS)
                        .record(attempt as f64);
                    return Ok(document);
                }
                Err(StoreError::DuplicateNumber(_)) => self.collided(&candidate, attempt).await,
                Err(e) => return Err(e.into()),
            }
        }
        Err(self.exhausted(kind))
    }

    /// Next candidate in the current year's series.
    async fn sample<S>(&self, store: &S, kind: DocumentKind) -> Result<DocumentNumber, AllocError>
    where
        S: DocumentStore + ?Sized,
    {
        let prefix = self.prefix(kind);
        let year = self.clock.current_year();
        let next = match store.latest_number(prefix, year).await? {
            Some(latest) => DocumentNumber::sequence_of(&latest)
                .and_then(|seq| seq.checked_add(1))
                .ok_or(AllocError::MalformedNumber(latest))?,
            None => 1,
        };
        Ok(DocumentNumber::new(prefix, year, next))
    }

    async fn collided(&self, candidate: &DocumentNumber, attempt: u32) {
        metrics::counter!(crate::observability::ALLOCATION_COLLISIONS_TOTAL).increment(1);
        debug!("document number {candidate} taken (attempt {attempt}/{})", self.max_attempts);
        if attempt < self.max_attempts {
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    fn exhausted(&self, kind: DocumentKind) -> AllocError {
        metrics::counter!(crate::observability::ALLOCATION_EXHAUSTED_TOTAL).increment(1);
        warn!("{kind} number allocation exhausted after {} attempts", self.max_attempts);
        AllocError::Exhausted {
            kind,
            attempts: self.max_attempts,
        }
    }
}
