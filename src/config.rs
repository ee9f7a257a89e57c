use crate::error::StoreError;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_COLLECTION: &str = "notes";

/// Connection settings for a note store.
///
/// Passed explicitly to each store constructor so independent stores (for
/// example a test fake next to a real database) never share state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Name of the document collection holding the notes.
    pub collection: String,
    /// `sqlx` connection string for [`SqliteStore`](crate::store::sqlite::SqliteStore).
    pub database_url: String,
    /// When set, the store re-reads the collection on this interval so
    /// writes from other sessions are pushed to watchers.
    pub poll_interval: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            collection: DEFAULT_COLLECTION.to_string(),
            database_url: sqlite_url(&default_database_path()),
            poll_interval: None,
        }
    }
}

impl StoreConfig {
    /// A config pointing at the given collection with default connection settings.
    pub fn for_collection(collection: &str) -> Self {
        StoreConfig {
            collection: collection.to_string(),
            ..Default::default()
        }
    }

    /// Builds a config from the defaults overridden by environment variables.
    ///
    /// - `NOTE_SYNC_DATABASE_URL`: connection string
    /// - `NOTE_SYNC_COLLECTION`: collection name
    /// - `NOTE_SYNC_POLL_MS`: poll interval in milliseconds, `0` disables polling
    ///
    /// Returns [`StoreError::Config`] if `NOTE_SYNC_POLL_MS` is not a number.
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, StoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = StoreConfig::default();

        if let Some(url) = lookup("NOTE_SYNC_DATABASE_URL").filter(|v| !v.is_empty()) {
            config.database_url = url;
        }

        if let Some(collection) = lookup("NOTE_SYNC_COLLECTION")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            config.collection = collection;
        }

        if let Some(poll) = lookup("NOTE_SYNC_POLL_MS").filter(|v| !v.is_empty()) {
            let millis: u64 = poll
                .trim()
                .parse()
                .map_err(|_| StoreError::Config(format!("NOTE_SYNC_POLL_MS is not a number: {poll}")))?;
            config.poll_interval = (millis > 0).then(|| Duration::from_millis(millis));
        }

        Ok(config)
    }

    /// Checks the collection name before any store uses it.
    ///
    /// Names must be non-empty and only contain ASCII letters, digits, `_` or
    /// `-`, so surrounding whitespace is rejected rather than stored.
    pub fn validate(&self) -> Result<(), StoreError> {
        let name = self.collection.as_str();

        if name.is_empty() {
            return Err(StoreError::Config("collection name cannot be empty".into()));
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(StoreError::Config(format!(
                "invalid char in collection name: {name}"
            )));
        }

        if self.database_url.trim().is_empty() {
            return Err(StoreError::Config("database url cannot be empty".into()));
        }

        Ok(())
    }
}

/// Formats a filesystem path as a SQLite connection string that creates the
/// file when missing.
pub fn sqlite_url(path: &std::path::Path) -> String {
    format!("sqlite:{}?mode=rwc", path.display())
}

/// Resolves `<data_local_dir>/note-sync/notes.db`, falling back to the
/// working directory when the platform has no data directory.
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("note-sync"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("notes.db")
}
