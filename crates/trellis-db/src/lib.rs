//! # trellis-db
//!
//! Storage collaborators for Trellis. The stream layer only ever sees the
//! [`Storage`] trait; concrete backends are selected per virtual host by name
//! through a [`StorageRegistry`] built once at startup:
//! - **memory**: process-local maps, for development and tests
//! - **sql**: SQLite via `sqlx`, schema created on connect
//!
//! Blocking work (password hashing) is pushed onto Tokio's blocking pool so
//! the calling session task suspends instead of stalling its worker thread.

pub mod memory;
pub mod password;
pub mod sql;
pub mod storage;

pub use memory::MemoryStorage;
pub use sql::SqlStorage;
pub use storage::{OfflineMessage, Storage, StorageBackend, StorageError, StorageRegistry, User};
