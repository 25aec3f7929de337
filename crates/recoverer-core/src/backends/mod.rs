//! Catalog backend implementations
//!
//! - `memory`: in-process catalog with fault injection (always available)
//! - `sqlite`: SQLite-backed catalog (requires `sqlite` feature)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryCatalog;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCatalog;
