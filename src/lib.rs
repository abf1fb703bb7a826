//! # Blockring
//! The distribution layer of a replicated block and inode storage cluster.
//!
//! This is a convenience package which re-exports the sub-projects within
//! Blockring:
//!
//! ### Features
//! - `blockring_distributor` - Placement, replication, caching and rebalancing of blocks and inodes.
//! - `blockring_sqlite` - A implementation of the block and inode stores using SQLite.

#[cfg(feature = "blockring-distributor")]
pub use blockring_distributor as distributor;
#[cfg(feature = "blockring-sqlite")]
pub use blockring_sqlite as sqlite;
