use time::Duration;

pub const DEFAULT_RETENTION_DAYS: u32 = 14;
pub const DEFAULT_WORKERS: usize = 1;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024 * 1024;

/// Immutable engine settings, built once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Views and active-object entries at or before `now - retention` are swept.
    pub retention: Duration,
    /// Number of tasks draining the ingestion queue.
    pub workers: usize,
    /// Bound of the ingestion queue, in datagrams.
    pub queue_capacity: usize,
}

impl EngineConfig {
    #[must_use]
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention = Duration::days(i64::from(days));
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention: Duration::days(i64::from(DEFAULT_RETENTION_DAYS)),
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}
