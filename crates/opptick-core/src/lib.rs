//! OppTick core: opportunity intake, deadline extraction and durable
//! reminder scheduling.

pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod intake;
pub mod locks;
pub mod model;
pub mod notify;
pub mod scheduler;
pub mod storage;
pub mod summary;
pub mod sweep;
pub mod title;
pub mod tracker;

pub use config::OppTickConfig;
pub use error::{OppTickError, Result};
pub use storage::{SqliteStorage, StorageBackend};
