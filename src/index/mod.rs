//! File index
//!
//! The single shared mutable resource of the engine and its transaction
//! boundary. Other components read and change records only through
//! [`FileIndex`].

pub mod record;
pub mod store;

pub use record::{FileId, FileStatus, FragmentEntry, IndexRecord, Layout, Target, TargetStatus};
pub use store::{FileIndex, IdentityGuard};
