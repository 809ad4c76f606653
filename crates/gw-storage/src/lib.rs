//! Hybrid storage: local/shared cache tiers with persistent write-through,
//! routed deterministically by key prefix.

pub mod cas;
pub mod entry;
pub mod janitor;
pub mod persistent;
pub mod store;

pub use cas::TypedCas;
pub use entry::{classify_key, StorageCategory, StorageEntry};
pub use janitor::Janitor;
pub use persistent::{PersistError, PersistentBackend, SqliteBackend};
pub use store::HybridStore;
