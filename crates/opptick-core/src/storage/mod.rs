mod backend;
mod sqlite;

pub use backend::{ReminderChange, StorageBackend, StoreStats};
pub use sqlite::{SqliteStorage, SCHEMA_VERSION};

use crate::config::OppTickConfig;
use crate::error::{OppTickError, Result};

/// Create a storage backend from the given configuration.
pub fn create_backend(config: &OppTickConfig) -> Result<SqliteStorage> {
    match config.storage.backend.as_str() {
        "sqlite" => {
            let path = config.database_path()?;
            let storage = SqliteStorage::open(&path)?;
            tracing::debug!(path = %path.display(), "opened sqlite storage");
            Ok(storage)
        }
        other => Err(OppTickError::Config(format!(
            "unknown storage backend: {other}"
        ))),
    }
}
