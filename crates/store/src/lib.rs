#![forbid(unsafe_code)]

mod backend;
mod error;
mod file;
mod sqlite;
mod store;

pub use backend::{LockOutcome, StoreBackend};
pub use error::StoreError;
pub use file::FileStore;
pub use sqlite::SqliteStore;
pub use store::{MirrorMode, Store, StoreMode, StoreOptions};
