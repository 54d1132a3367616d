//! Connect sequence.
//!
//! Steps:
//! - dial with a bounded timeout and require a server certificate
//! - `identify`: learn the server's public identity, confirming unknown
//!   (certificate, identity) pairs with the application
//! - `session`: run the key exchange
//! - welcome: negotiate policy and session parameters
//!
//! Every network step is bounded by the dial timeout. The confirmation is
//! bounded only by cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relaynet_core::error::{ProtocolError, RejectError, RelayError, Result, Subsystem};
use relaynet_core::policy::{ServerPolicy, DEFAULT_PING_LIMIT};
use relaynet_core::protocol::codec::encode_initial_cmd;
use relaynet_core::protocol::welcome::{negotiate, PAY_SCHEME_FREE};
use relaynet_core::protocol::{decode, Payload, PublicIdentity, CMD_IDENTIFY, CMD_SESSION, CMD_WELCOME};

use super::{KeeperParams, KnownServer};
use crate::intf::{Conn, FreePaymentClient, PaymentClient};
use crate::session::{SessionParams, SessionRunner, TaggedSession};

/// Upper bound on the `identify` reply.
const MAX_IDENTITY_LEN: usize = 64 * 1024;

pub(super) async fn connect(
    p: &KeeperParams,
    known: &watch::Sender<Option<KnownServer>>,
    cancel: &CancellationToken,
) -> Result<(TaggedSession, SessionRunner)> {
    let (mut conn, tls) = bounded(p.dial_timeout, "dial", cancel, p.dialer.dial()).await?;
    let remote = conn.remote_addr();
    debug!(%remote, "dialed server");

    let cert = tls
        .peer_certificates
        .first()
        .cloned()
        .ok_or(RejectError::NoPeerCert)?;

    // ---- identify
    let identity = bounded(p.dial_timeout, "identify", cancel, identify(&mut conn)).await?;
    let trusted = known
        .borrow()
        .as_ref()
        .map(|k| k.cert == cert && k.identity == identity)
        .unwrap_or(false);
    if !trusted {
        // Waits on the application for as long as it takes.
        tokio::select! {
            r = p.cert_confirmer.confirm(&tls, &identity) => {
                r.map_err(|e| RejectError::CertRejected(e.to_string()))?;
            }
            _ = cancel.cancelled() => return Err(RelayError::Exiting(Subsystem::ConnKeeper)),
        }
        info!(fingerprint = %identity.fingerprint(), nick = %identity.nick, "accepted new server identity");
        known.send_replace(Some(KnownServer {
            cert,
            identity: identity.clone(),
        }));
    }

    bounded(p.dial_timeout, "key exchange", cancel, open_session(p, conn, identity)).await
}

/// Run `fut` under `limit`, giving up early on cancellation.
async fn bounded<T, F>(
    limit: Duration,
    step: &str,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        r = timeout(limit, fut) => r.map_err(|_| RelayError::Transport(format!("{step} timeout")))?,
        _ = cancel.cancelled() => Err(RelayError::Exiting(Subsystem::ConnKeeper)),
    }
}

async fn identify(conn: &mut Box<dyn Conn>) -> Result<PublicIdentity> {
    write_initial(conn, CMD_IDENTIFY).await?;
    read_identity(conn).await
}

async fn open_session(
    p: &KeeperParams,
    mut conn: Box<dyn Conn>,
    identity: PublicIdentity,
) -> Result<(TaggedSession, SessionRunner)> {
    // ---- session + key exchange
    write_initial(&mut conn, CMD_SESSION).await?;
    let mut kx = p.handshaker.initiate(conn, &identity).await?;

    // ---- welcome
    let raw = kx.reader.read_msg().await?;
    let (msg, payload) = decode(&raw)?;
    let Payload::Welcome(welcome) = payload else {
        return Err(ProtocolError::UnexpectedCommand {
            got: msg.command,
            want: CMD_WELCOME,
        }
        .into());
    };
    let mut n = negotiate(&welcome)?;
    for prop in &n.ignored {
        warn!(key = %prop.key, value = %prop.value, "ignoring unknown optional server property");
    }

    let ping_interval = adjust_ping_interval(p.ping_interval, &mut n.policy)?;
    let pay_client = select_pay_client(&n.pay_scheme, &p.pay_client)?;

    info!(
        remote = %kx.remote_addr,
        tag_depth = n.tag_depth,
        pay_scheme = %n.pay_scheme,
        ?ping_interval,
        "session established"
    );
    let params = SessionParams {
        // One tag is kept back for pings.
        tag_depth: n.tag_depth - 1,
        ping_interval,
        log_pings: p.log_pings,
        policy: n.policy,
        pay_client,
        pay_scheme: n.pay_scheme,
        ln_node: n.ln_node,
        push_handler: p.push_handler.clone(),
    };
    Ok(TaggedSession::new(kx, params))
}

async fn write_initial(conn: &mut Box<dyn Conn>, cmd: &str) -> Result<()> {
    let line = encode_initial_cmd(cmd)?;
    conn.write_all(&line).await.map_err(RelayError::transport)?;
    conn.flush().await.map_err(RelayError::transport)
}

/// Read one newline-terminated JSON record without consuming anything past
/// the newline: the key exchange follows on the same connection.
async fn read_identity(conn: &mut Box<dyn Conn>) -> Result<PublicIdentity> {
    let mut line = Vec::with_capacity(512);
    loop {
        let b = conn.read_u8().await.map_err(RelayError::transport)?;
        if b == b'\n' {
            break;
        }
        if line.len() >= MAX_IDENTITY_LEN {
            return Err(ProtocolError::Decode {
                what: "server identity",
                reason: "too long".into(),
            }
            .into());
        }
        line.push(b);
    }
    serde_json::from_slice(&line).map_err(|e| {
        ProtocolError::Decode {
            what: "server identity",
            reason: e.to_string(),
        }
        .into()
    })
}

/// Fit the local ping interval to the server's ping limit.
pub(super) fn adjust_ping_interval(
    interval: Duration,
    policy: &mut ServerPolicy,
) -> Result<Duration> {
    let limit = policy.ping_limit;
    if limit < Duration::from_secs(1) {
        policy.ping_limit = DEFAULT_PING_LIMIT;
        return Ok(interval);
    }
    if interval.is_zero() || limit <= Duration::from_secs(1) || limit >= interval * 5 / 4 {
        return Ok(interval);
    }
    if limit < Duration::from_secs(30) && interval > limit {
        return Err(RejectError::ShortPingLimit { limit, interval }.into());
    }
    let adjusted = limit * 3 / 4;
    warn!(?adjusted, "reducing ping interval to fit server ping limit");
    Ok(adjusted)
}

pub(super) fn select_pay_client(
    server_scheme: &str,
    client: &Arc<dyn PaymentClient>,
) -> Result<Arc<dyn PaymentClient>> {
    if server_scheme == PAY_SCHEME_FREE {
        return Ok(Arc::new(FreePaymentClient));
    }
    if server_scheme != client.pay_scheme() {
        return Err(RejectError::PayScheme {
            client: client.pay_scheme().to_string(),
            server: server_scheme.to_string(),
        }
        .into());
    }
    Ok(client.clone())
}
