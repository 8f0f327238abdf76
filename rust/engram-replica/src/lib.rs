#![warn(missing_docs)]

//! The client-side replicated memory engine.
//!
//! A [`Repository`] maintains one [`Replica`] per memory space. Each replica
//! keeps a heap of committed revisions and a nursery of optimistic ones,
//! pulls missing facts from its remote on demand, pushes transactions with
//! conflict-safe causal chains, and relays reactive [`Notification`]s to
//! in-process observers.
//!
//! User code works through [`StorageTransaction`]: a path-granular,
//! optimistically-concurrent read/write handle whose journal (the
//! [`Chronicle`]) detects inconsistency, merges writes, and compiles down to
//! a single commit descriptor.
//!
//! ```ignore
//! use engram_remote::MemorySession;
//! use engram_replica::Repository;
//!
//! let repository = Repository::open(MemorySession::new());
//! let space = engram_facts::Space::generate()?;
//!
//! let transaction = repository.edit();
//! transaction.write(&space, &address, Some(serde_json::json!({ "on": true }))).await?;
//! transaction.commit().await?;
//! ```

mod cache;
pub use cache::*;

mod chronicle;
pub use chronicle::*;

mod error;
pub use error::*;

mod notification;
pub use notification::*;

mod replica;
pub use replica::*;

mod store;
pub use store::*;

mod transaction;
pub use transaction::*;
