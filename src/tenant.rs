use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::engine::{Engine, EngineSettings};
use crate::limits::*;
use crate::model::Ms;
use crate::reaper;

/// What every tenant engine is built with.
#[derive(Clone)]
pub struct TenantSettings {
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub calendar_retention_ms: Ms,
    pub engine: EngineSettings,
}

impl TenantSettings {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            compact_threshold: 1000,
            calendar_retention_ms: DEFAULT_CALENDAR_RETENTION_MS,
            engine: EngineSettings::default(),
        }
    }
}

/// Per-tenant engines, keyed by the database name of the pgwire connection.
/// Each tenant has its own journal, compactor and calendar reaper.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    /// Held while a new tenant's journal is replayed. Kept apart from the map
    /// so lookups of loaded tenants never wait on a replay.
    loading: Mutex<()>,
    settings: TenantSettings,
}

impl TenantManager {
    pub fn new(settings: TenantSettings) -> Self {
        Self {
            engines: DashMap::new(),
            loading: Mutex::new(()),
            settings,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Only [A-Za-z0-9_-] reaches the filesystem, and names that sanitize
        // alike share one journal, so they share one engine too.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }

        // One loader at a time, so a journal is never opened by two engines.
        let _loading = self
            .loading
            .lock()
            .map_err(|_| std::io::Error::other("tenant loader poisoned"))?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        let journal_path = self.settings.data_dir.join(format!("{safe_name}.journal"));
        let engine = Arc::new(Engine::new(journal_path, self.settings.engine.clone())?);
        self.engines.insert(safe_name.clone(), engine.clone());

        let compactor_engine = engine.clone();
        let threshold = self.settings.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold).await;
        });
        let reaper_engine = engine.clone();
        let retention = self.settings.calendar_retention_ms;
        tokio::spawn(async move {
            reaper::run_calendar_reaper(reaper_engine, retention).await;
        });

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("loaded tenant {safe_name}");
        Ok(engine)
    }
}
