//! Wire-level contracts: message model, two-record codec, server identity, welcome
//! negotiation.

pub mod codec;
pub mod identity;
pub mod message;
pub mod welcome;

pub use codec::{decode, encode};
pub use identity::PublicIdentity;
pub use message::*;
