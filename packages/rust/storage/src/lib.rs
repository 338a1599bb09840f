//! Storage layer for regwatch.
//!
//! One interface, [`RecordStore`], with two implementations selected at startup:
//! - [`LibsqlStore`]: libSQL embedded database (the normal, durable backend)
//! - [`FileStore`]: single-writer JSON snapshot guarded by an OS file lock
//!
//! [`DedupStore`] layers the deduplicating upsert on top of either.

mod database;
mod dedup;
mod file;
mod migrations;
mod store;

use std::sync::Arc;

use regwatch_shared::{RegwatchError, Result, StorageConfig, expand_home};

pub use database::LibsqlStore;
pub use dedup::DedupStore;
pub use file::FileStore;
pub use store::RecordStore;

/// Open the configured store: the database first, the file store if that fails
/// and fallback is allowed.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn RecordStore>> {
    let db_path = expand_home(&config.database_path);
    match LibsqlStore::open(&db_path).await {
        Ok(store) => {
            tracing::info!(path = %db_path.display(), "using libsql store");
            Ok(Arc::new(store))
        }
        Err(db_err) if config.allow_fallback => {
            let fallback = expand_home(&config.fallback_path);
            tracing::warn!(
                error = %db_err,
                fallback = %fallback.display(),
                "database unavailable, falling back to single-writer file store"
            );
            Ok(Arc::new(FileStore::open(&fallback)?))
        }
        Err(db_err) => Err(RegwatchError::storage_unavailable(format!(
            "database unavailable and fallback disabled: {db_err}"
        ))),
    }
}
