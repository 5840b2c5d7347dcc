//! Per-cartel configuration. Spec §6 pins most of these as literal
//! constants; they are still exposed as overridable fields (with
//! `Default` matching the spec) rather than baked-in constants, the way
//! the teacher's device models take a `Config` struct rather than reading
//! compiled-in numbers (e.g. `devices::virtio::fs::passthrough::Config`).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CartelConfig {
    /// Bounded descriptor-table capacity (spec §3, §6: 320).
    pub descriptor_table_capacity: usize,
    /// Anonymous-pipe ring buffer size in bytes (spec §3, §4.3: 512 —
    /// this is also `PIPE_BUF`, the atomic-write threshold).
    pub pipe_buffer_size: usize,
    /// VMFS cache window size (spec §4.6: 8 KiB).
    pub vmfs_cache_window: usize,
    /// VMFS sector size (spec §4.6: 512).
    pub vmfs_sector_size: usize,
    /// Periodic VMFS flush interval (spec §4.6, §6: 60s).
    pub vmfs_flush_interval: Duration,
    /// Proxy send-retry backoff schedule (spec §4.5, §6): 1, 3, 5, ... ms,
    /// capped at 50ms per attempt, ~90s total giveup.
    pub proxy_backoff_step_ms: u64,
    pub proxy_backoff_cap_ms: u64,
    pub proxy_backoff_giveup: Duration,
    /// Unix-domain accept backlog ceiling (spec §4.4; exact number
    /// recovered from `original_source/user/userSocketUnix.c`, see
    /// `SPEC_FULL.md` §10).
    pub unix_backlog_max: usize,
    /// Max bytes of payload in a unix-socket name (spec §6: 108).
    pub unix_name_max: usize,
}

impl Default for CartelConfig {
    fn default() -> Self {
        Self {
            descriptor_table_capacity: 320,
            pipe_buffer_size: 512,
            vmfs_cache_window: 8192,
            vmfs_sector_size: 512,
            vmfs_flush_interval: Duration::from_secs(60),
            proxy_backoff_step_ms: 1,
            proxy_backoff_cap_ms: 50,
            proxy_backoff_giveup: Duration::from_secs(90),
            unix_backlog_max: 128,
            unix_name_max: 108,
        }
    }
}
