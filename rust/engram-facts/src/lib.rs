#![warn(missing_docs)]

//! The data model of the engram replicated memory engine.
//!
//! A memory [`Space`] holds facts: JSON documents addressed by an
//! `(entity, media type)` pair and versioned through a causal chain of
//! content-addressed [`Reference`]s. This crate defines the fact lifecycle
//! ([`Assertion`], [`Retraction`], unclaimed), the [`Revision`] wrapper that
//! pins a fact to the commit version at which a remote observed it, the
//! path-granular [`Address`]/[`Attestation`] vocabulary used by transaction
//! journals, the [`FactSelector`] query builder, and the signed wire
//! [`protocol`] spoken between a replica and its remote.
//!
//! ```ignore
//! use engram_facts::{Assertion, Entity, MediaType, Reference};
//!
//! let assertion = Assertion {
//!     the: MediaType::json(),
//!     of: "test:profile".parse()?,
//!     is: serde_json::json!({ "name": "Foo Bar" }),
//!     cause: None,
//! };
//!
//! // Facts are content addressed; their reference seeds the causal chain
//! // of every later version.
//! let cause = Reference::of(&assertion)?;
//! ```

mod canonical;
pub use canonical::*;

mod error;
pub use error::*;

mod facts;
pub use facts::*;

mod links;
pub use links::*;

mod path;
pub use path::*;

pub mod protocol;

mod reference;
pub use reference::*;

mod uri;
pub use uri::*;

#[cfg(any(test, feature = "helpers"))]
mod helpers;
#[cfg(any(test, feature = "helpers"))]
pub use helpers::*;
