//! Shared error type across relaynet crates.
//!
//! Errors are a closed sum: the layer that can make a retry decision matches
//! on the variant instead of probing error strings at runtime.

use thiserror::Error;

use crate::rvid::RvId;

/// Stable classification of an error, used for logging and by callers that
/// only care about the broad category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection read/write failure.
    Transport,
    /// Malformed frame or protocol violation.
    Protocol,
    /// Server ack carrying an error.
    Application,
    /// Invoice or payment failure.
    Payment,
    /// A loop shut down while the caller was waiting.
    Exiting,
    /// Session closed on request.
    Closed,
    /// Rejected locally before reaching the network.
    Rejected,
}

impl ErrorClass {
    /// String representation used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transport => "TRANSPORT",
            ErrorClass::Protocol => "PROTOCOL",
            ErrorClass::Application => "APPLICATION",
            ErrorClass::Payment => "PAYMENT",
            ErrorClass::Exiting => "EXITING",
            ErrorClass::Closed => "CLOSED",
            ErrorClass::Rejected => "REJECTED",
        }
    }
}

/// Loop that reported an [`RelayError::Exiting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    SessionSendLoop,
    SessionRecvLoop,
    Rmq,
    RvManager,
    ConnKeeper,
}

impl Subsystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Subsystem::SessionSendLoop => "session send loop",
            Subsystem::SessionRecvLoop => "session receive loop",
            Subsystem::Rmq => "rmq",
            Subsystem::RvManager => "rendezvous manager",
            Subsystem::ConnKeeper => "conn keeper",
        }
    }
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol violations. All of these are fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unable to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },
    #[error("unable to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("received reply {cmd:?} for unregistered tag {tag}")]
    InvalidRecvTag { cmd: String, tag: u32 },
    #[error("unexpected command {got:?}, wanted {want:?}")]
    UnexpectedCommand { got: String, want: &'static str },
    #[error("unexpected reply {0:?}")]
    UnexpectedReply(String),
    #[error("unwelcome: {0}")]
    Unwelcome(String),
    #[error("invalid welcome: {0}")]
    InvalidWelcome(String),
    #[error("pong timeout")]
    PongTimeout,
    #[error("send loop stalled for {0:?}")]
    Stalled(std::time::Duration),
}

/// Payment failures. These are recovered by the component that pays.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("unpaid subscription to RV {0}")]
    UnpaidSubscription(RvId),
    #[error("invoice payment error on RM push")]
    InvoicePayment,
    #[error("server sent expired invoice")]
    InvoiceExpired,
    #[error("server sent invoice with amount instead of zero")]
    NonZeroInvoice,
    #[error("unable to decode invoice: {0}")]
    InvoiceDecode(String),
    #[error("payment failed: {0}")]
    PayFailed(String),
    #[error("push cost overflows")]
    PushCostOverflow,
}

/// Local rejections. The request never reached the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectError {
    #[error("message too large: {size} > {max}")]
    TooLarge { size: u64, max: u64 },
    #[error("already subscribed to RV {0}")]
    AlreadySubscribed(RvId),
    #[error("not subscribed to RV {0}")]
    NotSubscribed(RvId),
    #[error("subscription to RV {0} canceled before registration")]
    SubscriptionCanceled(RvId),
    #[error("unable to encrypt message: {0}")]
    Encrypt(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("server certificate rejected: {0}")]
    CertRejected(String),
    #[error("server did not provide a TLS certificate")]
    NoPeerCert,
    #[error("mismatched payment scheme: client {client}, server {server}")]
    PayScheme { client: String, server: String },
    #[error("server ping limit {limit:?} too short for ping interval {interval:?}")]
    ShortPingLimit {
        limit: std::time::Duration,
        interval: std::time::Duration,
    },
    #[error("invalid priority {0}")]
    Priority(u8),
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Unified error type used by core and client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("ack error: {msg} (code {code}, non_fatal {non_fatal})")]
    Application {
        code: i64,
        msg: String,
        non_fatal: bool,
    },
    #[error("payment: {0}")]
    Payment(#[from] PaymentError),
    #[error("{0}: subsystem exiting")]
    Exiting(Subsystem),
    #[error("close requested: {0}")]
    CloseRequested(String),
    #[error("rejected: {0}")]
    Rejected(#[from] RejectError),
}

impl RelayError {
    /// Map to a stable class.
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::Transport(_) => ErrorClass::Transport,
            RelayError::Protocol(_) => ErrorClass::Protocol,
            RelayError::Application { .. } => ErrorClass::Application,
            RelayError::Payment(_) => ErrorClass::Payment,
            RelayError::Exiting(_) => ErrorClass::Exiting,
            RelayError::CloseRequested(_) => ErrorClass::Closed,
            RelayError::Rejected(_) => ErrorClass::Rejected,
        }
    }

    pub fn transport(e: impl std::fmt::Display) -> Self {
        RelayError::Transport(e.to_string())
    }

    /// Ack error built from a server error string.
    pub fn ack(msg: impl Into<String>) -> Self {
        RelayError::Application {
            code: 0,
            msg: msg.into(),
            non_fatal: false,
        }
    }

    pub fn is_exiting(&self) -> bool {
        matches!(self, RelayError::Exiting(_))
    }

    /// Whether a pushed-message handler returning this error must tear the
    /// session down once the ack is written.
    pub fn is_fatal_to_session(&self) -> bool {
        !matches!(
            self,
            RelayError::Application {
                non_fatal: true,
                ..
            }
        )
    }

    /// The id named by an unpaid subscription error, if this is one.
    pub fn unpaid_rv(&self) -> Option<RvId> {
        match self {
            RelayError::Payment(PaymentError::UnpaidSubscription(id)) => Some(*id),
            _ => None,
        }
    }

    /// `(code, message)` to place in an ack for this error.
    pub fn ack_fields(&self) -> (i64, String) {
        match self {
            RelayError::Application { code, msg, .. } => (*code, msg.clone()),
            other => (0, other.to_string()),
        }
    }
}

const UNPAID_SUBSCRIPTION_PREFIX: &str = "unpaid subscription to RV ";

/// Classify an error string returned by the server in a reply payload.
pub fn parse_server_error(s: &str) -> RelayError {
    if s == PaymentError::InvoicePayment.to_string() {
        return RelayError::Payment(PaymentError::InvoicePayment);
    }
    if let Some(rest) = s.strip_prefix(UNPAID_SUBSCRIPTION_PREFIX) {
        if let Ok(id) = rest.trim().parse::<RvId>() {
            return RelayError::Payment(PaymentError::UnpaidSubscription(id));
        }
    }
    RelayError::ack(s)
}
