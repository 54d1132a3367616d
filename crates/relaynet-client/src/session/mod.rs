//! Tagged session multiplexer.
//!
//! Many callers issue requests over one secured stream. Each outbound
//! request takes a tag from a bounded pool; the server echoes the tag in
//! its reply, which routes the reply back to the caller and frees the tag.
//! One tag beyond the pool is reserved for keepalive pings.
//!
//! [`TaggedSession`] is the cloneable handle. [`SessionRunner`] owns the
//! stream and must be driven with [`SessionRunner::run`].

mod driver;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use relaynet_core::error::{RelayError, Result, Subsystem};
use relaynet_core::policy::ServerPolicy;
use relaynet_core::protocol::{Message, Payload};

use crate::intf::{KxStream, PaymentClient, PushHandler, ReplySink, ServerSession};

pub use driver::SessionRunner;

/// Parameters fixed when the session is established.
#[derive(Clone)]
pub struct SessionParams {
    /// Number of tags available for requests. Tag `tag_depth` itself is
    /// used for pings.
    pub tag_depth: u32,
    /// Zero disables pings.
    pub ping_interval: Duration,
    pub log_pings: bool,
    pub policy: ServerPolicy,
    pub pay_client: Arc<dyn PaymentClient>,
    pub pay_scheme: String,
    pub ln_node: String,
    pub push_handler: Option<Arc<dyn PushHandler>>,
}

impl std::fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionParams")
            .field("tag_depth", &self.tag_depth)
            .field("ping_interval", &self.ping_interval)
            .field("pay_scheme", &self.pay_scheme)
            .finish_non_exhaustive()
    }
}

/// A request on its way to the wire.
pub(crate) struct WireMsg {
    pub msg: Message,
    pub payload: Payload,
    /// Resolved once the write completes or fails.
    pub write_done: oneshot::Sender<Result<()>>,
    pub reply: Option<ReplySink>,
}

struct Shared {
    remote_addr: String,
    policy: ServerPolicy,
    pay_client: Arc<dyn PaymentClient>,
    pay_scheme: String,
    ln_node: String,
    send_tx: mpsc::Sender<WireMsg>,
    close_tx: mpsc::Sender<RelayError>,
    done: CancellationToken,
}

#[derive(Clone)]
pub struct TaggedSession {
    shared: Arc<Shared>,
}

impl TaggedSession {
    /// Wrap an established stream. Nothing is read or written until the
    /// returned runner is started.
    pub fn new(kx: KxStream, params: SessionParams) -> (TaggedSession, SessionRunner) {
        let (send_tx, send_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = mpsc::channel(1);
        let done = CancellationToken::new();

        let shared = Arc::new(Shared {
            remote_addr: kx.remote_addr.clone(),
            policy: params.policy.clone(),
            pay_client: params.pay_client.clone(),
            pay_scheme: params.pay_scheme.clone(),
            ln_node: params.ln_node.clone(),
            send_tx,
            close_tx,
            done: done.clone(),
        });

        let runner = SessionRunner::new(kx, params, send_rx, close_rx, done);
        (TaggedSession { shared }, runner)
    }
}

impl std::fmt::Debug for TaggedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedSession")
            .field("remote_addr", &self.shared.remote_addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ServerSession for TaggedSession {
    async fn send_prpc(&self, payload: Payload, reply: Option<ReplySink>) -> Result<()> {
        let exiting = || RelayError::Exiting(Subsystem::SessionSendLoop);
        let (tx, rx) = oneshot::channel();
        let wm = WireMsg {
            msg: Message::new(payload.command()),
            payload,
            write_done: tx,
            reply,
        };

        tokio::select! {
            r = self.shared.send_tx.send(wm) => r.map_err(|_| exiting())?,
            _ = self.shared.done.cancelled() => return Err(exiting()),
        }
        rx.await.unwrap_or_else(|_| Err(exiting()))
    }

    fn request_close(&self, reason: RelayError) {
        // Full means a close is already pending.
        let _ = self.shared.close_tx.try_send(reason);
    }

    fn done(&self) -> CancellationToken {
        self.shared.done.clone()
    }

    fn pay_client(&self) -> Arc<dyn PaymentClient> {
        self.shared.pay_client.clone()
    }

    fn policy(&self) -> &ServerPolicy {
        &self.shared.policy
    }

    fn pay_scheme(&self) -> &str {
        &self.shared.pay_scheme
    }

    fn ln_node(&self) -> &str {
        &self.shared.ln_node
    }

    fn remote_addr(&self) -> &str {
        &self.shared.remote_addr
    }
}
