//! relaynet core: transport-agnostic protocol primitives, error types, server
//! policy and the outbound priority queue.
//!
//! Nothing here depends on an async runtime so it can be reused by the
//! client engine, mock servers and tooling alike.
//!
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! Fallible paths surface as `RelayError`/`Result`.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod multipriq;
pub mod policy;
pub mod protocol;
pub mod rvid;

pub use error::{RelayError, Result};
pub use rvid::{RvId, ShortId};
