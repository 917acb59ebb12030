//! Syndicate User Gateway
//!
//! A wide-area storage gateway presenting a POSIX-like view of a shared
//! volume.  File blocks live in object stores behind Replica Gateways and
//! canonical metadata lives on the Metadata Service; each file has at most
//! one coordinator gateway, and all writes flow through it.

pub mod client;
pub mod closure;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fs;
pub mod gateway;
pub mod manifest;
pub mod ms;
pub mod network;
pub mod replication;
pub mod storage;
pub mod sync;
pub mod vacuum;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::Gateway;
