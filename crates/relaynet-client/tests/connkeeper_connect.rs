#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]


use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relaynet_client::intf::{
    CertConfirmer, Conn, Dialer, FreePaymentClient, Handshaker, KxStream, ServerSession, TlsState,
};
use relaynet_client::rendezvous::RvManager;
use relaynet_client::rmq::Rmq;
use relaynet_client::{ConnKeeper, KeeperParams, KnownServer, SessionBinder};
use relaynet_core::protocol::welcome::{PROP_PAYMENT_SCHEME, PROP_SERVER_TIME, PROP_TAG_DEPTH};
use relaynet_core::protocol::{
    GetInvoiceReply, Payload, PublicIdentity, RouteMessageReply, ServerProperty, Welcome,
    PROTOCOL_VERSION,
};
use relaynet_core::{RelayError, Result, ShortId};

use mock_server::{framed_kx, read_line, write_line, MockServer};
use mocks::{rv, MemDb, TestRm};

const CERT: &[u8] = b"leaf-cert";

struct MockConn(DuplexStream);

impl AsyncRead for MockConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl Conn for MockConn {
    fn remote_addr(&self) -> String {
        "mock:443".into()
    }
}

/// Hands the server end of every dialed connection to the test.
struct MockDialer {
    servers: mpsc::UnboundedSender<DuplexStream>,
    cert: Option<Vec<u8>>,
    dials: AtomicUsize,
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self) -> Result<(Box<dyn Conn>, TlsState)> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(1 << 20);
        self.servers
            .send(server)
            .map_err(|_| RelayError::Transport("refused".into()))?;
        let tls = TlsState {
            peer_certificates: self.cert.iter().cloned().collect(),
        };
        Ok((Box::new(MockConn(client)), tls))
    }
}

struct FramedHandshaker;

#[async_trait]
impl Handshaker for FramedHandshaker {
    async fn initiate(&self, conn: Box<dyn Conn>, _server: &PublicIdentity) -> Result<KxStream> {
        let remote = conn.remote_addr();
        Ok(framed_kx(conn, &remote))
    }
}

#[derive(Default)]
struct CountingConfirmer {
    calls: AtomicUsize,
    reject: bool,
    /// How long the user takes to answer.
    think: Duration,
    seen: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl CertConfirmer for CountingConfirmer {
    async fn confirm(&self, tls: &TlsState, _server: &PublicIdentity) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.think).await;
        self.seen
            .lock()
            .unwrap()
            .extend(tls.peer_certificates.iter().cloned());
        if self.reject {
            return Err(RelayError::ack("user declined"));
        }
        Ok(())
    }
}

struct Harness {
    keeper: ConnKeeper,
    dialer: Arc<MockDialer>,
    confirmer: Arc<CountingConfirmer>,
    servers: mpsc::UnboundedReceiver<DuplexStream>,
    cancel: CancellationToken,
}

fn harness(cert: Option<&[u8]>, reject: bool) -> Harness {
    harness_with(
        cert,
        CountingConfirmer {
            reject,
            ..Default::default()
        },
    )
}

fn harness_with(cert: Option<&[u8]>, confirmer: CountingConfirmer) -> Harness {
    let (tx, servers) = mpsc::unbounded_channel();
    let dialer = Arc::new(MockDialer {
        servers: tx,
        cert: cert.map(<[u8]>::to_vec),
        dials: AtomicUsize::new(0),
    });
    let confirmer = Arc::new(confirmer);
    let params = KeeperParams {
        dialer: dialer.clone(),
        handshaker: Arc::new(FramedHandshaker),
        cert_confirmer: confirmer.clone(),
        pay_client: Arc::new(FreePaymentClient),
        push_handler: None,
        dial_timeout: Duration::from_secs(30),
        reconnect_delay: Duration::from_secs(1),
        ping_interval: Duration::ZERO,
        log_pings: false,
        go_online: true,
    };
    let (keeper, runner) = ConnKeeper::new(params);
    let cancel = CancellationToken::new();
    tokio::spawn(runner.run(cancel.clone()));
    Harness {
        keeper,
        dialer,
        confirmer,
        servers,
        cancel,
    }
}

fn identity() -> PublicIdentity {
    PublicIdentity {
        name: "relay".into(),
        nick: "r1".into(),
        sig_key: ShortId::from([1; 32]),
        identity: ShortId::from([2; 32]),
        extra: Default::default(),
    }
}

fn welcome(tag_depth: &str) -> Welcome {
    let prop = |key: &str, value: &str| ServerProperty {
        key: key.into(),
        value: value.into(),
        required: true,
    };
    Welcome {
        version: PROTOCOL_VERSION,
        server_time: 1_700_000_000,
        properties: vec![
            prop(PROP_TAG_DEPTH, tag_depth),
            prop(PROP_SERVER_TIME, "1700000000"),
            prop(PROP_PAYMENT_SCHEME, "free"),
        ],
    }
}

/// Answer `identify`, returning the stream positioned before `session`.
async fn serve_identify(mut s: DuplexStream) -> DuplexStream {
    assert_eq!(read_line(&mut s).await, "\"identify\"");
    write_line(&mut s, &serde_json::to_string(&identity()).unwrap()).await;
    s
}

/// Full pre-session exchange followed by the welcome.
async fn serve_session(s: DuplexStream, w: Welcome) -> MockServer {
    let mut s = serve_identify(s).await;
    assert_eq!(read_line(&mut s).await, "\"session\"");
    let mut server = MockServer::new(s);
    server.send(0, Payload::Welcome(w)).await;
    server
}

async fn accept(h: &mut Harness, w: Welcome) -> MockServer {
    let s = h.servers.recv().await.unwrap();
    serve_session(s, w).await
}

#[tokio::test(start_paused = true)]
async fn connects_and_reconnects_without_reconfirming() {
    let mut h = harness(Some(CERT), false);

    let server = tokio::spawn({
        let s = h.servers.recv().await.unwrap();
        serve_session(s, welcome("10"))
    });
    let sess = h.keeper.next_session(&h.cancel).await.unwrap();
    let server = server.await.unwrap();
    assert_eq!(sess.remote_addr(), "mock:443");
    assert_eq!(sess.pay_scheme(), "free");
    assert_eq!(h.confirmer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*h.confirmer.seen.lock().unwrap(), vec![CERT.to_vec()]);
    assert_eq!(
        h.keeper.known_server_identity(),
        Some(KnownServer {
            cert: CERT.to_vec(),
            identity: identity(),
        })
    );

    drop(server);
    assert!(h.keeper.next_session(&h.cancel).await.is_none());
    assert!(sess.done().is_cancelled());

    let server = tokio::spawn({
        let s = h.servers.recv().await.unwrap();
        serve_session(s, welcome("10"))
    });
    let sess = h.keeper.next_session(&h.cancel).await.unwrap();
    let _server = server.await.unwrap();
    assert!(!sess.done().is_cancelled());
    assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 2);
    assert_eq!(h.confirmer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn preset_identity_skips_confirmation() {
    let mut h = harness(Some(CERT), true);
    h.keeper.set_known_server_identity(CERT.to_vec(), identity());

    let server = tokio::spawn({
        let s = h.servers.recv().await.unwrap();
        serve_session(s, welcome("4"))
    });
    assert!(h.keeper.next_session(&h.cancel).await.is_some());
    let _server = server.await.unwrap();
    assert_eq!(h.confirmer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_certificate_aborts_connection() {
    let mut h = harness(Some(CERT), true);

    let s = h.servers.recv().await.unwrap();
    let mut s = serve_identify(s).await;
    // Dropped by the client without asking for a session.
    assert!(s.read_u8().await.is_err());
    assert_eq!(h.confirmer.calls.load(Ordering::SeqCst), 1);
    assert!(h.keeper.known_server_identity().is_none());

    // Retried after the reconnect delay.
    let _next = h.servers.recv().await.unwrap();
    assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_confirmation_outlasts_dial_timeout() {
    let mut h = harness_with(
        Some(CERT),
        CountingConfirmer {
            think: Duration::from_secs(120),
            ..Default::default()
        },
    );

    let server = tokio::spawn({
        let s = h.servers.recv().await.unwrap();
        serve_session(s, welcome("10"))
    });
    let sess = h.keeper.next_session(&h.cancel).await.unwrap();
    let _server = server.await.unwrap();
    assert!(!sess.done().is_cancelled());
    assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 1);
    assert!(h.keeper.known_server_identity().is_some());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_confirmation_exits() {
    let mut h = harness_with(
        Some(CERT),
        CountingConfirmer {
            think: Duration::from_secs(24 * 3600),
            ..Default::default()
        },
    );

    let s = h.servers.recv().await.unwrap();
    let mut s = serve_identify(s).await;
    while h.confirmer.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.cancel.cancel();
    assert!(s.read_u8().await.is_err());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.keeper.is_done());
    assert!(h.keeper.known_server_identity().is_none());
    assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_certificate_never_identifies() {
    let mut h = harness(None, false);

    let mut s = h.servers.recv().await.unwrap();
    assert!(s.read_u8().await.is_err());
    assert_eq!(h.confirmer.calls.load(Ordering::SeqCst), 0);

    let next = tokio::time::timeout(
        Duration::from_millis(100),
        h.keeper.next_session(&h.cancel),
    )
    .await;
    assert!(next.is_err(), "no session without a certificate");
}

#[tokio::test(start_paused = true)]
async fn tag_depth_below_minimum_is_refused() {
    let mut h = harness(Some(CERT), false);
    let mut server = accept(&mut h, welcome("1")).await;
    assert!(server.closed().await);

    let next = tokio::time::timeout(
        Duration::from_millis(100),
        h.keeper.next_session(&h.cancel),
    )
    .await;
    assert!(next.is_err());
}

#[tokio::test(start_paused = true)]
async fn offline_closes_session_until_online_again() {
    let mut h = harness(Some(CERT), false);

    let server = tokio::spawn({
        let s = h.servers.recv().await.unwrap();
        serve_session(s, welcome("10"))
    });
    let sess = h.keeper.next_session(&h.cancel).await.unwrap();
    let _server = server.await.unwrap();

    h.keeper.remain_offline();
    assert!(!h.keeper.is_online());
    assert!(h.keeper.next_session(&h.cancel).await.is_none());
    sess.done().cancelled().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 1);

    h.keeper.go_online();
    let server = tokio::spawn({
        let s = h.servers.recv().await.unwrap();
        serve_session(s, welcome("10"))
    });
    assert!(h.keeper.next_session(&h.cancel).await.is_some());
    let _server = server.await.unwrap();
    assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_keeper() {
    let h = harness(None, false);
    h.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.keeper.is_done());
    assert!(h.keeper.next_session(&CancellationToken::new()).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn binder_routes_queued_message_over_new_session() {
    let mut h = harness(Some(CERT), false);
    let (rmq, rmq_runner) = Rmq::new(Arc::new(MemDb::default()));
    let (rvm, rvm_runner) = RvManager::new(Arc::new(MemDb::default()), Duration::from_millis(100));
    tokio::spawn(rmq_runner.run(h.cancel.clone()));
    tokio::spawn(rvm_runner.run(h.cancel.clone()));
    let binder = SessionBinder::new(h.keeper.clone(), rmq.clone(), rvm.clone());
    let bound = tokio::spawn(binder.run(h.cancel.clone()));

    let sender = {
        let rmq = rmq.clone();
        tokio::spawn(async move { rmq.send_rm(TestRm::new(rv(1), b"hello")).await })
    };

    let mut server = accept(&mut h, welcome("10")).await;
    let (msg, payload) = server.recv_request().await;
    assert_eq!(payload.command(), "getinvoice");
    server
        .send(
            msg.tag,
            Payload::GetInvoiceReply(GetInvoiceReply {
                invoice: "free".into(),
            }),
        )
        .await;
    let (msg, payload) = server.recv_request().await;
    let Payload::RouteMessage(route) = payload else {
        panic!("expected routemessage");
    };
    assert_eq!(route.message, b"hello");
    server
        .send(msg.tag, Payload::RouteMessageReply(RouteMessageReply::default()))
        .await;

    assert_eq!(sender.await.unwrap(), Ok(()));
    assert!(rvm.is_up_to_date());

    h.cancel.cancel();
    assert_eq!(bound.await.unwrap(), Ok(()));
}
