//! I/O priority constants for cache accounts.

/// I/O priority of the shared default reads account.
pub const CACHE_READS_IO_PRIORITY: i32 = 100;

/// Outstanding-request limit of the shared default reads account.
pub const CACHE_READS_OUTSTANDING_LIMIT: i32 = 16;
