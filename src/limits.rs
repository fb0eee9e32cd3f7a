use crate::model::Ms;

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 128;

/// Mirrored calendar events held per tenant.
pub const MAX_CALENDAR_EVENTS_PER_TENANT: usize = 50_000;
/// Rows accepted in one multi-row `INSERT INTO calendar_events`.
pub const MAX_BATCH_SIZE: usize = 1_000;
/// Longest start string we accept from the calendar provider.
pub const MAX_START_LEN: usize = 64;
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024;

/// Issued documents (tombstones included) per tenant.
pub const MAX_DOCUMENTS_PER_TENANT: usize = 1_000_000;
pub const MAX_CLIENT_LEN: usize = 512;
pub const MAX_PREFIX_LEN: usize = 8;

pub const DEFAULT_CALENDAR_RETENTION_MS: Ms = 7 * 24 * 3_600_000;
