//! Seams between the session engine and the rest of the application:
//! payments, persistence, transport, key exchange and pushed-message
//! delivery.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use relaynet_core::error::{Result, Subsystem};
use relaynet_core::policy::ServerPolicy;
use relaynet_core::protocol::{Payload, PublicIdentity, PushRoutedMessage};
use relaynet_core::{RelayError, RvId};

// --------------------
// Payments
// --------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub id: Vec<u8>,
    pub amount_matoms: u64,
    pub expiry: SystemTime,
}

impl DecodedInvoice {
    /// Whether the invoice expires within `affordance` from now.
    pub fn is_expired(&self, affordance: Duration) -> bool {
        SystemTime::now() + affordance >= self.expiry
    }
}

#[async_trait]
pub trait PaymentClient: Send + Sync {
    /// Payment scheme this client can pay with, matched against the
    /// server's advertised scheme.
    fn pay_scheme(&self) -> &str;

    async fn decode_invoice(&self, invoice: &str) -> Result<DecodedInvoice>;

    /// Pay `amount_matoms` to a zero-amount invoice. Returns fees paid.
    async fn pay_invoice_amount(&self, invoice: &str, amount_matoms: u64) -> Result<u64>;

    /// Wait for an earlier payment of `invoice` to settle. Returns the fees
    /// paid, or an error if the payment failed or is unknown.
    async fn is_payment_completed(&self, invoice: &str) -> Result<u64>;
}

/// Payment client used against servers that do not charge.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreePaymentClient;

#[async_trait]
impl PaymentClient for FreePaymentClient {
    fn pay_scheme(&self) -> &str {
        relaynet_core::protocol::welcome::PAY_SCHEME_FREE
    }

    async fn decode_invoice(&self, _invoice: &str) -> Result<DecodedInvoice> {
        Ok(DecodedInvoice {
            id: Vec::new(),
            amount_matoms: 0,
            expiry: SystemTime::now() + Duration::from_secs(365 * 24 * 3600),
        })
    }

    async fn pay_invoice_amount(&self, _invoice: &str, _amount_matoms: u64) -> Result<u64> {
        Ok(0)
    }

    async fn is_payment_completed(&self, _invoice: &str) -> Result<u64> {
        Ok(0)
    }
}

// --------------------
// Persistence
// --------------------

/// Durable record of which rendezvous subscriptions were paid for.
#[async_trait]
pub trait RvPersistence: Send + Sync {
    /// Subset of `rvs` that has not been paid within `expiration_days`.
    async fn unpaid_rvs(&self, rvs: &[RvId], expiration_days: u32) -> Result<Vec<RvId>>;
    async fn save_paid_rvs(&self, rvs: &[RvId]) -> Result<()>;
    async fn mark_rv_unpaid(&self, rv: RvId) -> Result<()>;
}

/// Durable record of push payments in progress, so a push paid for before
/// a disconnect or restart is not paid for twice.
#[async_trait]
pub trait RmqPersistence: Send + Sync {
    /// Record that `invoice` is being paid to push to `rv`.
    async fn store_rv_payment_attempt(&self, rv: RvId, invoice: &str, at: SystemTime)
        -> Result<()>;
    /// The invoice and time stored for `rv`, if any.
    async fn rv_payment_attempt(&self, rv: RvId) -> Result<Option<(String, SystemTime)>>;
    async fn delete_rv_payment_attempt(&self, rv: RvId) -> Result<()>;
}

// --------------------
// Outbound routed messages
// --------------------

/// A message waiting in the outbound queue. Encryption is deferred until
/// the item is about to be sent.
pub trait OutboundRm: Send + Sync {
    /// 0 (most important) through 4.
    fn priority(&self) -> u8;
    /// Size of the message once encrypted, used for the size cap.
    fn encrypted_len(&self) -> u64;
    fn encrypted_msg(&self) -> Result<(RvId, Vec<u8>)>;
    /// Called once per payment attempt with the amount and fees paid.
    fn paid_for_rm(&self, amount_matoms: u64, fees_matoms: u64);
}

impl fmt::Debug for dyn OutboundRm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundRm")
            .field("priority", &self.priority())
            .field("encrypted_len", &self.encrypted_len())
            .finish()
    }
}

// --------------------
// Transport
// --------------------

pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {
    fn remote_addr(&self) -> String;
}

/// Certificates presented by the server during the TLS handshake, leaf
/// first, DER encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsState {
    pub peer_certificates: Vec<Vec<u8>>,
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<(Box<dyn Conn>, TlsState)>;
}

/// Asked to approve a server whose (certificate, identity) pair has not
/// been seen before. Returning an error aborts the connection attempt.
#[async_trait]
pub trait CertConfirmer: Send + Sync {
    async fn confirm(&self, tls: &TlsState, server: &PublicIdentity) -> Result<()>;
}

#[async_trait]
pub trait MsgReader: Send {
    async fn read_msg(&mut self) -> Result<Bytes>;
}

#[async_trait]
pub trait MsgWriter: Send {
    async fn write_msg(&mut self, msg: Bytes) -> Result<()>;
}

/// Secured, message-oriented stream produced by the key exchange.
pub struct KxStream {
    pub reader: Box<dyn MsgReader>,
    pub writer: Box<dyn MsgWriter>,
    pub remote_addr: String,
}

impl fmt::Debug for KxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KxStream")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Runs the client side of the key exchange over a raw connection.
#[async_trait]
pub trait Handshaker: Send + Sync {
    async fn initiate(&self, conn: Box<dyn Conn>, server: &PublicIdentity) -> Result<KxStream>;
}

// --------------------
// Sessions
// --------------------

/// Reply (or failure) for a tagged request.
pub type Reply = Result<Payload>;
pub type ReplySink = oneshot::Sender<Reply>;

/// Receives messages pushed by the server on subscribed rendezvous points.
///
/// `Ok` acks success; an `Application { non_fatal: true, .. }` error is
/// acked and the session kept; any other error is acked and then the
/// session is closed.
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn handle_pushed(&self, msg: PushRoutedMessage) -> Result<()>;
}

/// A live, authenticated server session.
#[async_trait]
pub trait ServerSession: Send + Sync {
    /// Queue `payload` as a tagged request. Returns once the request is
    /// written. The reply, if wanted, is delivered to `reply`.
    async fn send_prpc(&self, payload: Payload, reply: Option<ReplySink>) -> Result<()>;

    /// Ask the session to terminate with `reason`. Never blocks; a second
    /// request while one is pending is dropped.
    fn request_close(&self, reason: RelayError);

    /// Cancelled once the session has fully terminated.
    fn done(&self) -> CancellationToken;

    fn pay_client(&self) -> Arc<dyn PaymentClient>;
    fn policy(&self) -> &ServerPolicy;
    fn pay_scheme(&self) -> &str;
    fn ln_node(&self) -> &str;
    fn remote_addr(&self) -> &str;

    /// `(push rate, sub rate)` in milliatoms.
    fn payment_rates(&self) -> (u64, u64) {
        let p = self.policy();
        (p.push_pay_rate, p.sub_pay_rate)
    }

    fn expiration_days(&self) -> u32 {
        self.policy().expiration_days
    }

    /// Send `payload` and wait for its reply.
    async fn request(&self, payload: Payload) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.send_prpc(payload, Some(tx)).await?;
        recv_reply(rx).await
    }
}

pub type Session = Arc<dyn ServerSession>;

impl fmt::Debug for dyn ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("remote_addr", &self.remote_addr())
            .finish_non_exhaustive()
    }
}

/// Wait for a reply sink to be resolved. A dropped sink means the session
/// went away before the reply arrived.
pub async fn recv_reply(rx: oneshot::Receiver<Reply>) -> Reply {
    rx.await
        .unwrap_or(Err(RelayError::Exiting(Subsystem::SessionRecvLoop)))
}
