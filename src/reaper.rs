use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::info;

use crate::engine::Engine;
use crate::model::Ms;

const COMPACT_INTERVAL: Duration = Duration::from_secs(30);
const CALENDAR_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that rewrites the journal once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            tracing::error!("compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` appends happened since the last one.
/// Returns whether it compacted.
pub async fn compact_if_due(
    engine: &Engine,
    threshold: u64,
) -> Result<bool, crate::engine::EngineError> {
    let appends = engine.appends_since_compact().await?;
    if appends < threshold {
        return Ok(false);
    }
    let kept = engine.compact().await?;
    info!("compacted journal: {appends} appends folded into {kept} events");
    Ok(true)
}

/// Background task that drops mirrored calendar events older than
/// `retention_ms`.
pub async fn run_calendar_reaper(engine: Arc<Engine>, retention_ms: Ms) {
    let mut interval = tokio::time::interval(CALENDAR_REAP_INTERVAL);
    loop {
        interval.tick().await;
        let cutoff = retention_cutoff(Local::now(), retention_ms);
        match engine.prune_calendar_before(&cutoff).await {
            Ok(0) => {}
            Ok(n) => {
                metrics::counter!(crate::observability::CALENDAR_PRUNED_TOTAL).increment(n as u64);
                info!("reaped {n} calendar events dated before {cutoff}");
            }
            Err(e) => tracing::debug!("calendar reaper skip: {e}"),
        }
    }
}

/// `YYYY-MM-DD` of `now - retention_ms`, in `now`'s timezone.
pub fn retention_cutoff<Tz: chrono::TimeZone>(now: DateTime<Tz>, retention_ms: Ms) -> String
where
    Tz::Offset: std::fmt::Display,
{
    (now - chrono::Duration::milliseconds(retention_ms))
        .format("%Y-%m-%d")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::model::*;
    use chrono::{FixedOffset, TimeZone};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_journal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("orcdesk_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn cutoff_subtracts_retention() {
        let tz = FixedOffset::west_opt(3 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2025, 3, 10, 14, 30, 0).unwrap();
        assert_eq!(retention_cutoff(now, 7 * 24 * 3_600_000), "2025-03-03");
        assert_eq!(retention_cutoff(now, 0), "2025-03-10");
        // Crosses a month boundary
        assert_eq!(retention_cutoff(now, 10 * 24 * 3_600_000), "2025-02-28");
    }

    #[tokio::test]
    async fn calendar_prune_keeps_recent() {
        let path = test_journal_path("prune.journal");
        let engine = Arc::new(Engine::new(path, EngineSettings::default()).unwrap());

        let old = Ulid::new();
        let recent = Ulid::new();
        engine
            .upsert_calendar_events(vec![
                CalendarEvent::timed(old, "2025-03-01T10:00:00-03:00"),
                CalendarEvent::timed(recent, "2025-03-09T10:00:00-03:00"),
            ])
            .await
            .unwrap();

        let pruned = engine.prune_calendar_before("2025-03-03").await.unwrap();
        assert_eq!(pruned, 1);

        let ids: Vec<Ulid> = engine.calendar_events().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![recent]);
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let path = test_journal_path("compact_threshold.journal");
        let engine = Arc::new(Engine::new(path.clone(), EngineSettings::default()).unwrap());

        for _ in 0..3 {
            engine
                .issue_document(DocumentKind::Quote, Ulid::new(), None)
                .await
                .unwrap();
        }

        assert!(!compact_if_due(&engine, 10).await.unwrap());
        assert!(compact_if_due(&engine, 3).await.unwrap());
        assert_eq!(engine.appends_since_compact().await.unwrap(), 0);

        drop(engine);
        let reopened = Engine::new(path, EngineSettings::default()).unwrap();
        assert_eq!(reopened.list_documents(DocumentKind::Quote, None).len(), 3);
    }
}
