use crate::model::{Ms, MINUTE_MS};

// ── Partitions ───────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

// ── Catalog ──────────────────────────────────────────────────────

pub const MAX_ESTABLISHMENTS_PER_TENANT: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
/// UTC-14:00 ..= UTC+14:00
pub const MAX_UTC_OFFSET_MINUTES: i16 = 14 * 60;
pub const MAX_WINDOWS_PER_ESTABLISHMENT: usize = 512;
pub const MAX_SERVICES_PER_ESTABLISHMENT: usize = 1024;
pub const MAX_STAFF_PER_ESTABLISHMENT: usize = 1024;
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;

// ── Ledger ───────────────────────────────────────────────────────

pub const MAX_APPOINTMENTS_PER_SCOPE: usize = 200_000;

/// 1970-01-01 .. 9999-12-31T23:59:59.999
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

// ── Slot generation ──────────────────────────────────────────────

/// Step between candidate start times inside an open window.
pub const SLOT_GRANULARITY_MS: Ms = 30 * MINUTE_MS;

// ── Commit path ──────────────────────────────────────────────────

pub const WAL_CHANNEL_CAPACITY: usize = 4096;
pub const STORAGE_RETRY_BACKOFF_MS: u64 = 25;
