use std::env;
use std::fmt::Display;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::{EngineSettings, Prefixes, SlotGrid, SystemClock};
use crate::limits::{DEFAULT_CALENDAR_RETENTION_MS, MAX_PREFIX_LEN};
use crate::model::Ms;
use crate::tenant::TenantSettings;
use crate::timefmt;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("both ORCDESK_TLS_CERT and ORCDESK_TLS_KEY must be set, or neither")]
    PartialTls,

    #[error("tls: {0}")]
    Tls(#[from] io::Error),
}

/// Certificate and key PEM files for the pgwire listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsPaths {
    pub fn acceptor(&self) -> Result<TlsAcceptor, ConfigError> {
        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(&self.cert)?))
            .collect::<Result<_, _>>()?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&self.key)?))?
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "no private key found in key file")
            })?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Process configuration, read once from `ORCDESK_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub calendar_retention_ms: Ms,
    pub prefixes: Prefixes,
    pub grid: SlotGrid,
    pub tls: Option<TlsPaths>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let retention_default = DEFAULT_CALENDAR_RETENTION_MS.to_string();

        let prefixes = Prefixes {
            quote: prefix(&lookup, "ORCDESK_QUOTE_PREFIX", "ORC")?,
            invoice: prefix(&lookup, "ORCDESK_INVOICE_PREFIX", "FAT")?,
        };

        let grid = SlotGrid {
            open: slot_time(&lookup, "ORCDESK_SLOT_OPEN", "09:00")?,
            close: slot_time(&lookup, "ORCDESK_SLOT_CLOSE", "17:00")?,
            step_minutes: try_load(&lookup, "ORCDESK_SLOT_STEP_MINUTES", "30")?,
        };
        if grid.step_minutes == 0 {
            return Err(invalid("ORCDESK_SLOT_STEP_MINUTES", "0", "must be positive"));
        }
        if grid.open >= grid.close {
            return Err(invalid(
                "ORCDESK_SLOT_CLOSE",
                &timefmt::format_24h(grid.close / 60, grid.close % 60),
                "must be after ORCDESK_SLOT_OPEN",
            ));
        }

        let tls = match (lookup("ORCDESK_TLS_CERT"), lookup("ORCDESK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };

        let metrics_port = match lookup("ORCDESK_METRICS_PORT") {
            None => None,
            Some(raw) => Some(parse("ORCDESK_METRICS_PORT", &raw)?),
        };

        let max_connections: usize = try_load(&lookup, "ORCDESK_MAX_CONNECTIONS", "256")?;
        if max_connections == 0 {
            return Err(invalid("ORCDESK_MAX_CONNECTIONS", "0", "must be positive"));
        }

        Ok(Self {
            port: try_load(&lookup, "ORCDESK_PORT", "5433")?,
            bind: try_load(&lookup, "ORCDESK_BIND", "0.0.0.0")?,
            data_dir: try_load(&lookup, "ORCDESK_DATA_DIR", "./data")?,
            password: lookup("ORCDESK_PASSWORD").unwrap_or_else(|| {
                warn!("ORCDESK_PASSWORD not set, using the default password");
                "orcdesk".into()
            }),
            max_connections,
            compact_threshold: try_load(&lookup, "ORCDESK_COMPACT_THRESHOLD", "1000")?,
            calendar_retention_ms: try_load(
                &lookup,
                "ORCDESK_CALENDAR_RETENTION_MS",
                &retention_default,
            )?,
            prefixes,
            grid,
            tls,
            metrics_port,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tenant_settings(&self) -> TenantSettings {
        TenantSettings {
            data_dir: self.data_dir.clone(),
            compact_threshold: self.compact_threshold,
            calendar_retention_ms: self.calendar_retention_ms,
            engine: EngineSettings {
                prefixes: self.prefixes.clone(),
                grid: self.grid,
                clock: Arc::new(SystemClock),
            },
        }
    }
}

fn try_load<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let raw = lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    parse(key, &raw)
}

fn parse<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    raw.trim().parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        invalid(key, raw, &e.to_string())
    })
}

fn prefix(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<String, ConfigError> {
    let value: String = try_load(lookup, key, default)?;
    if value.is_empty() || value.len() > MAX_PREFIX_LEN {
        return Err(invalid(
            key,
            &value,
            &format!("must be 1 to {MAX_PREFIX_LEN} characters"),
        ));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid(key, &value, "must be ASCII letters or digits"));
    }
    Ok(value)
}

fn slot_time(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<u32, ConfigError> {
    let raw: String = try_load(lookup, key, default)?;
    timefmt::minutes_of_day(&raw).ok_or_else(|| invalid(key, &raw, "expected HH:MM"))
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
