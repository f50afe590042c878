//! Database configuration.

/// Configuration for opening a database.
///
/// New connections inherit the cache defaults configured here and may
/// override them afterwards; changing the defaults does not affect
/// connections that already exist.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to fsync the log on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Default per-connection object cache limit, in entries. 0 = unbounded.
    pub object_cache_limit: usize,

    /// Default per-connection metadata cache limit, in entries.
    /// 0 = unbounded.
    pub metadata_cache_limit: usize,

    /// Shared cross-connection object cache limit, in entries.
    /// 0 = unbounded.
    pub shared_cache_limit: usize,

    /// How many commit notifications to retain for sibling catch-up. A
    /// connection that falls further behind resets its caches wholesale.
    pub notification_history_limit: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            object_cache_limit: 250,
            metadata_cache_limit: 500,
            shared_cache_limit: 1000,
            notification_history_limit: 512,
        }
    }
}

impl DatabaseConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to fsync the log on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the default per-connection object cache limit.
    #[must_use]
    pub const fn object_cache_limit(mut self, limit: usize) -> Self {
        self.object_cache_limit = limit;
        self
    }

    /// Sets the default per-connection metadata cache limit.
    #[must_use]
    pub const fn metadata_cache_limit(mut self, limit: usize) -> Self {
        self.metadata_cache_limit = limit;
        self
    }

    /// Sets the shared cross-connection cache limit.
    #[must_use]
    pub const fn shared_cache_limit(mut self, limit: usize) -> Self {
        self.shared_cache_limit = limit;
        self
    }

    /// Sets the commit notification history limit.
    #[must_use]
    pub const fn notification_history_limit(mut self, limit: usize) -> Self {
        self.notification_history_limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DatabaseConfig::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert_eq!(config.object_cache_limit, 250);
        assert_eq!(config.metadata_cache_limit, 500);
    }

    #[test]
    fn builder_pattern() {
        let config = DatabaseConfig::new()
            .sync_on_commit(false)
            .object_cache_limit(10)
            .notification_history_limit(4);
        assert!(!config.sync_on_commit);
        assert_eq!(config.object_cache_limit, 10);
        assert_eq!(config.notification_history_limit, 4);
    }
}
