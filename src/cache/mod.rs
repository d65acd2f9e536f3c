//! Build cache engine
//!
//! Key resolution over a storage scope, archive packing, bounded concurrent
//! transfers, whole-scope eviction and the restore/save session built on them.

pub mod archive;
pub mod eviction;
pub mod item;
pub mod locks;
pub mod repository;
pub mod session;
pub mod transfer;

pub use item::StorageScope;
pub use locks::JobLocks;
pub use repository::ObjectRepository;
pub use session::{CacheRequest, CacheSession, SaveStatus};
pub use transfer::is_interrupted;
