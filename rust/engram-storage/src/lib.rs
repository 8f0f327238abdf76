#![warn(missing_docs)]

//! This crate contains a generalized API for constructing keyed storage from
//! different backends and encoding schemes. The replicated memory engine uses
//! it for its best-effort revision cache, but nothing in this crate is
//! specific to that use.
//!
//! In order to use it, first select or implement an [Encoder], and then select
//! or implement a [StorageBackend]. When you have selected these things, you
//! can construct a [Storage]:
//!
//! ```rust
//! use engram_storage::{Storage, JsonEncoder, MemoryStorageBackend};
//!
//! // Create a JSON encoder for serialization/deserialization
//! let encoder = JsonEncoder;
//!
//! // Create an in-memory storage backend with explicit types
//! let backend = MemoryStorageBackend::<String, Vec<u8>>::default();
//!
//! // Combine them into a Storage instance
//! let storage = Storage { encoder, backend };
//! ```

mod encoder;
pub use encoder::*;

mod error;
pub use error::*;

mod storage;
pub use storage::*;
