//! relaynet client: the runtime half of the session engine.
//!
//! Components (each an actor driven by its own `run` future):
//! - [`session`]: tagged request/reply multiplexer over one secured stream
//! - [`rmq`]: paid, priority-ordered outbound message queue
//! - [`rendezvous`]: subscription manager for server-pushed messages
//! - [`connkeeper`]: connection supervisor producing sessions
//! - [`binder`]: rebinds the queue and manager on every session change
//!
//! Collaborators the application provides (payments, persistence,
//! transport, key exchange) are traits in [`intf`].

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod binder;
pub mod config;
pub mod connkeeper;
pub mod intf;
pub mod payments;
pub mod rendezvous;
pub mod rmq;
pub mod session;
pub mod telemetry;
pub mod timer;

pub use binder::SessionBinder;
pub use connkeeper::{ConnKeeper, ConnKeeperRunner, KeeperParams, KnownServer};
pub use intf::{ServerSession, Session};
pub use rendezvous::{PushedRm, RvHandler, RvManager, RvManagerRunner};
pub use rmq::{Rmq, RmqRunner};
pub use session::{SessionParams, SessionRunner, TaggedSession};
