pub mod access;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod patch;
pub mod reconcile;
pub mod registry;
pub mod store;
pub mod stream;
pub mod types;
pub mod watch;

pub use config::SyncConfig;
pub use error::{Result, StreamError, SyncError};
pub use events::WatchEvent;
pub use history::HistoryService;
pub use store::WatchStore;
pub use watch::{SyncEngine, WatchMeta};
