//! Local block storage: the staging cache and dirty-block bookkeeping

pub mod cache;
pub mod dirty;

pub use cache::{BlockCache, FlushTicket};
pub use dirty::DirtyBlock;
