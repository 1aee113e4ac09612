use crate::model::Ms;

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_KIND_LEN: usize = 64;
pub const MAX_DESCRIPTION_LEN: usize = 4096;

pub const MAX_EVENTS_PER_TENANT: usize = 100_000;
pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_ALLOCATIONS_PER_TENANT: usize = 100_000;

pub const MAX_TENANT_NAME_LEN: usize = 64;
pub const MAX_TENANTS: usize = 1024;

/// 1970-01-01T00:00
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
