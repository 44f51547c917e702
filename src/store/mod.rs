//! On-disk plumbing for requirement documents
//!
//! - `lock`: advisory per-document side-file locks with stale reclaim
//! - `writer`: backup + temp + rename commits
//! - `collection`: directory scan for document files

pub mod collection;
pub mod lock;
pub mod writer;

pub use collection::{Collection, CollectionEntry, SkippedDocument};
pub use lock::{owner_token, Acquisition, LockGuard, LockInfo, StaleLock};
pub use writer::{CommitOutcome, PendingCommit};
