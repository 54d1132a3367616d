//! Single-dependency entry point for relaynet.
//!
//! `core` holds the runtime-free protocol pieces, `client` the session
//! engine. Applications wiring up a client usually only need [`prelude`].

pub mod core {
    pub use relaynet_core::*;
}

pub mod client {
    pub use relaynet_client::*;
}

/// Types needed to assemble a running client: the supervisor, the queue,
/// the subscription manager, the binder between them and the collaborator
/// traits the application implements.
pub mod prelude {
    pub use relaynet_client::config::{self, ClientConfig};
    pub use relaynet_client::intf::{
        CertConfirmer, Conn, Dialer, Handshaker, KxStream, MsgReader, MsgWriter, OutboundRm,
        PaymentClient, RmqPersistence, RvPersistence,
    };
    pub use relaynet_client::rendezvous::{PushedRm, RvHandler};
    pub use relaynet_client::{
        telemetry, ConnKeeper, KeeperParams, Rmq, RvManager, ServerSession, Session,
        SessionBinder,
    };
    pub use relaynet_core::{RelayError, Result, RvId};
}
