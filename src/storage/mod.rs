//! Storage backends for check result and incident persistence
//!
//! This module provides a trait-based abstraction over the persistence
//! collaborator. The checker core never talks to a backend directly: the
//! `StorageActor` subscribes to the event stream and writes through the
//! `StorageBackend` trait, the API reads through it.
//!
//! ## Design
//!
//! - **Trait-based**: `StorageBackend` trait allows swapping implementations
//! - **Async**: All operations are async for compatibility with Tokio actors
//! - **Idempotent**: Writes are keyed by UUID and can be retried safely
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database, doubles as the monitor registry
//! - **In-Memory**: No persistence, for testing or running without a database
//!
//! ## Usage
//!
//! ```no_run
//! use apiwatch::storage::{StorageBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./apiwatch.db").await?;
//!     let open = backend.open_incidents().await?;
//!     println!("{} open incidents", open.len());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use schema::UptimeStats;
