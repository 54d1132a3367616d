//! Connection supervisor.
//!
//! Keeps a session to the server open while the application wants to be
//! online: connects, hands the session to [`ConnKeeper::next_session`]
//! callers, and reconnects after a delay when it fails.

mod handshake;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use relaynet_core::error::{RelayError, Result};
use relaynet_core::protocol::PublicIdentity;

use crate::config::ClientConfig;
use crate::intf::{CertConfirmer, Dialer, Handshaker, PaymentClient, PushHandler, ServerSession, Session};

/// Last server (certificate, identity) pair the application trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownServer {
    pub cert: Vec<u8>,
    pub identity: PublicIdentity,
}

/// Collaborators and tunables for the supervisor.
#[derive(Clone)]
pub struct KeeperParams {
    pub dialer: Arc<dyn Dialer>,
    pub handshaker: Arc<dyn Handshaker>,
    pub cert_confirmer: Arc<dyn CertConfirmer>,
    pub pay_client: Arc<dyn PaymentClient>,
    pub push_handler: Option<Arc<dyn PushHandler>>,
    pub dial_timeout: Duration,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub log_pings: bool,
    pub go_online: bool,
}

impl KeeperParams {
    /// Tunables from `cfg`, collaborators from the caller.
    pub fn from_config(
        cfg: &ClientConfig,
        dialer: Arc<dyn Dialer>,
        handshaker: Arc<dyn Handshaker>,
        cert_confirmer: Arc<dyn CertConfirmer>,
        pay_client: Arc<dyn PaymentClient>,
    ) -> Self {
        Self {
            dialer,
            handshaker,
            cert_confirmer,
            pay_client,
            push_handler: None,
            dial_timeout: cfg.keeper.dial_timeout(),
            reconnect_delay: cfg.keeper.reconnect_delay(),
            ping_interval: cfg.session.ping_interval(),
            log_pings: cfg.session.log_pings,
            go_online: cfg.keeper.go_online,
        }
    }

    pub fn with_push_handler(mut self, handler: Arc<dyn PushHandler>) -> Self {
        self.push_handler = Some(handler);
        self
    }
}

impl std::fmt::Debug for KeeperParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeeperParams")
            .field("dial_timeout", &self.dial_timeout)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("ping_interval", &self.ping_interval)
            .field("go_online", &self.go_online)
            .finish_non_exhaustive()
    }
}

struct Shared {
    online: watch::Sender<bool>,
    known: watch::Sender<Option<KnownServer>>,
    sessions: Mutex<mpsc::UnboundedReceiver<Option<Session>>>,
    done: CancellationToken,
}

#[derive(Clone)]
pub struct ConnKeeper {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnKeeper")
            .field("online", &*self.shared.online.borrow())
            .finish_non_exhaustive()
    }
}

impl ConnKeeper {
    pub fn new(params: KeeperParams) -> (ConnKeeper, ConnKeeperRunner) {
        let (online, online_rx) = watch::channel(params.go_online);
        let (known, _) = watch::channel(None);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            online,
            known,
            sessions: Mutex::new(session_rx),
            done: CancellationToken::new(),
        });
        let runner = ConnKeeperRunner {
            shared: shared.clone(),
            params,
            online_rx,
            session_tx,
        };
        (ConnKeeper { shared }, runner)
    }

    /// Wait for the next session transition: `Some` when a session comes
    /// up, `None` when it goes down. Also `None` on cancellation or once
    /// the supervisor has exited.
    pub async fn next_session(&self, cancel: &CancellationToken) -> Option<Session> {
        let mut rx = tokio::select! {
            rx = self.shared.sessions.lock() => rx,
            _ = cancel.cancelled() => return None,
        };
        tokio::select! {
            s = rx.recv() => s.flatten(),
            _ = cancel.cancelled() => None,
            _ = self.shared.done.cancelled() => None,
        }
    }

    pub fn go_online(&self) {
        self.shared.online.send_replace(true);
    }

    /// Close the current session, if any, and stay offline until
    /// [`go_online`](Self::go_online).
    pub fn remain_offline(&self) {
        self.shared.online.send_replace(false);
    }

    pub fn is_online(&self) -> bool {
        *self.shared.online.borrow()
    }

    /// Trust `identity` presented with `cert` without asking the
    /// certificate confirmer.
    pub fn set_known_server_identity(&self, cert: Vec<u8>, identity: PublicIdentity) {
        self.shared
            .known
            .send_replace(Some(KnownServer { cert, identity }));
    }

    pub fn known_server_identity(&self) -> Option<KnownServer> {
        self.shared.known.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.is_cancelled()
    }
}

pub struct ConnKeeperRunner {
    shared: Arc<Shared>,
    params: KeeperParams,
    online_rx: watch::Receiver<bool>,
    session_tx: mpsc::UnboundedSender<Option<Session>>,
}

impl ConnKeeperRunner {
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let span = tracing::info_span!("connkeeper");
        self.run_inner(&cancel).instrument(span).await
    }

    async fn run_inner(mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            // ---- wait until wanted online
            while !*self.online_rx.borrow_and_update() {
                tokio::select! {
                    r = self.online_rx.changed() => if r.is_err() { return self.exit() },
                    _ = cancel.cancelled() => return self.exit(),
                }
            }

            let connected = handshake::connect(&self.params, &self.shared.known, cancel).await;
            let skip_delay = match connected {
                Ok((sess, runner)) => {
                    let handle: Session = Arc::new(sess);
                    let _ = self.session_tx.send(Some(handle.clone()));

                    let err = self.supervise(handle, runner, cancel).await;
                    let _ = self.session_tx.send(None);
                    if cancel.is_cancelled() {
                        return self.exit();
                    }
                    match &err {
                        RelayError::CloseRequested(_) => {
                            info!(reason = %err, "session closed");
                            true
                        }
                        _ => {
                            warn!(error = %err, class = err.class().as_str(), "session failed");
                            false
                        }
                    }
                }
                Err(_) if cancel.is_cancelled() => return self.exit(),
                Err(e) => {
                    warn!(error = %e, class = e.class().as_str(), "unable to connect");
                    false
                }
            };

            if !skip_delay && !self.params.reconnect_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.params.reconnect_delay) => {}
                    _ = cancel.cancelled() => return self.exit(),
                }
            }
            if cancel.is_cancelled() {
                return self.exit();
            }
        }
    }

    /// Run `runner` to completion, closing the session if asked to go
    /// offline meanwhile.
    async fn supervise(
        &mut self,
        handle: Session,
        runner: crate::session::SessionRunner,
        cancel: &CancellationToken,
    ) -> RelayError {
        let run = runner.run(cancel.child_token());
        tokio::pin!(run);
        let mut watching = true;
        loop {
            tokio::select! {
                err = &mut run => return err,
                r = self.online_rx.changed(), if watching => {
                    if r.is_err() {
                        watching = false;
                    } else if !*self.online_rx.borrow_and_update() {
                        handle.request_close(RelayError::CloseRequested("remaining offline".into()));
                    }
                }
            }
        }
    }

    fn exit(&self) -> Result<()> {
        self.shared.done.cancel();
        info!("conn keeper exiting");
        Ok(())
    }
}
