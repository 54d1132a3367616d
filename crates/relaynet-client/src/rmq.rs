//! Outbound routed-message queue.
//!
//! Callers enqueue [`OutboundRm`] items which are sent, one at a time and in
//! the order chosen by the multi-priority queue, to whichever server session
//! is currently bound. Each push is paid for before it is sent. Items
//! survive session changes: an item whose send did not complete is resent
//! on the next session.
//!
//! Every push payment is recorded before it is made. A resend within the
//! server's push payment lifetime reuses the recorded payment instead of
//! paying again; the record is dropped once the server acks the push.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use relaynet_core::error::{
    parse_server_error, PaymentError, ProtocolError, RejectError, RelayError, Result, Subsystem,
};
use relaynet_core::multipriq::{MultiPriorityQueue, LANES};
use relaynet_core::policy::MAX_MSG_SIZE_V0;
use relaynet_core::protocol::{InvoiceAction, Payload, RouteMessage};
use relaynet_core::RvId;

use crate::intf::{OutboundRm, RmqPersistence, ServerSession, Session};
use crate::payments;

/// How long to wait for an earlier push payment to settle before paying
/// again.
const PAYMENT_COMPLETION_WAIT: Duration = Duration::from_secs(60);

/// Resolved once the item is acked by the server, rejected, or the queue
/// shuts down.
pub type RmReply = oneshot::Sender<Result<()>>;

struct QueuedRm {
    orm: Arc<dyn OutboundRm>,
    reply: Option<RmReply>,
}

struct Shared {
    enqueue_tx: mpsc::Sender<QueuedRm>,
    session_tx: mpsc::Sender<Option<Session>>,
    pending: AtomicUsize,
    drained: Notify,
    max_msg_size: AtomicU64,
    done: CancellationToken,
}

impl Shared {
    fn resolved(&self) {
        if self.pending.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.drained.notify_waiters();
        }
    }
}

fn exiting() -> RelayError {
    RelayError::Exiting(Subsystem::Rmq)
}

#[derive(Clone)]
pub struct Rmq {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Rmq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rmq").field("len", &self.len()).finish()
    }
}

impl Rmq {
    pub fn new(db: Arc<dyn RmqPersistence>) -> (Rmq, RmqRunner) {
        let (enqueue_tx, enqueue_rx) = mpsc::channel(1);
        let (session_tx, session_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            enqueue_tx,
            session_tx,
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
            max_msg_size: AtomicU64::new(MAX_MSG_SIZE_V0),
            done: CancellationToken::new(),
        });
        let runner = RmqRunner {
            shared: shared.clone(),
            db,
            enqueue_rx,
            session_rx,
        };
        (Rmq { shared }, runner)
    }

    /// Largest encrypted message the bound server accepts.
    pub fn max_msg_size(&self) -> u64 {
        self.shared.max_msg_size.load(Ordering::Relaxed)
    }

    /// Number of items enqueued and not yet resolved, including the one
    /// being sent.
    pub fn len(&self) -> usize {
        self.shared.pending.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every enqueued item has been resolved or the queue exits.
    pub async fn wait_done(&self) {
        loop {
            let drained = self.shared.drained.notified();
            if self.is_empty() || self.shared.done.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = drained => {}
                _ = self.shared.done.cancelled() => return,
            }
        }
    }

    /// Enqueue `orm`. `reply` is resolved once the item is done. Fails
    /// immediately for oversized items.
    pub async fn queue_rm(&self, orm: Arc<dyn OutboundRm>, reply: Option<RmReply>) -> Result<()> {
        let size = orm.encrypted_len();
        let max = self.max_msg_size();
        if size > max {
            return Err(RejectError::TooLarge { size, max }.into());
        }
        let pri = orm.priority();
        if pri as usize >= LANES {
            return Err(RejectError::Priority(pri).into());
        }

        self.shared.pending.fetch_add(1, Ordering::Relaxed);
        let sent = tokio::select! {
            r = self.shared.enqueue_tx.send(QueuedRm { orm, reply }) => r.is_ok(),
            _ = self.shared.done.cancelled() => false,
        };
        if !sent {
            self.shared.resolved();
            return Err(exiting());
        }
        Ok(())
    }

    /// Enqueue `orm` and wait until the server acks it.
    pub async fn send_rm(&self, orm: Arc<dyn OutboundRm>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.queue_rm(orm, Some(tx)).await?;
        rx.await.unwrap_or_else(|_| Err(exiting()))
    }

    /// Switch the queue to `sess`, or pause sending when `None`.
    pub async fn bind_to_session(&self, sess: Option<Session>) -> Result<()> {
        tokio::select! {
            r = self.shared.session_tx.send(sess) => r.map_err(|_| exiting()),
            _ = self.shared.done.cancelled() => Err(exiting()),
        }
    }
}

pub struct RmqRunner {
    shared: Arc<Shared>,
    db: Arc<dyn RmqPersistence>,
    enqueue_rx: mpsc::Receiver<QueuedRm>,
    session_rx: mpsc::Receiver<Option<Session>>,
}

impl RmqRunner {
    /// Run until `cancel` fires. Every waiting caller is released with an
    /// exiting error before this returns.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let RmqRunner {
            shared,
            db,
            mut enqueue_rx,
            mut session_rx,
        } = self;

        let (want_tx, mut want_rx) = mpsc::channel(1);
        let mut queue = MultiPriorityQueue::new();
        let mut sender = SendState::new(shared.clone(), db);

        tokio::select! {
            _ = enqueue_loop(&mut enqueue_rx, &mut want_rx, &mut queue) => {}
            _ = sender.run(&mut session_rx, &want_tx) => {}
            _ = cancel.cancelled() => {}
        }

        // ---- teardown
        shared.done.cancel();
        enqueue_rx.close();
        sender.shutdown();
        for item in queue.drain() {
            reply(item.reply, Err(exiting()));
        }
        while let Ok(item) = enqueue_rx.try_recv() {
            reply(item.reply, Err(exiting()));
        }
        shared.pending.store(0, Ordering::Relaxed);
        shared.drained.notify_waiters();
        debug!("rmq exiting");
        Ok(())
    }
}

fn reply(sink: Option<RmReply>, res: Result<()>) {
    if let Some(sink) = sink {
        let _ = sink.send(res);
    }
}

// --------------------
// Enqueue side
// --------------------

/// Owns the priority queue. Hands one item to the send side each time it
/// asks for one.
async fn enqueue_loop(
    incoming: &mut mpsc::Receiver<QueuedRm>,
    wants: &mut mpsc::Receiver<oneshot::Sender<QueuedRm>>,
    queue: &mut MultiPriorityQueue<QueuedRm>,
) {
    let mut waiter: Option<oneshot::Sender<QueuedRm>> = None;
    loop {
        if waiter.is_some() {
            if let Some(item) = queue.pop() {
                if let Some(w) = waiter.take() {
                    if let Err(item) = w.send(item) {
                        reply(item.reply, Err(exiting()));
                    }
                }
            }
        }

        tokio::select! {
            Some(item) = incoming.recv() => {
                let pri = item.orm.priority();
                if pri as usize >= LANES {
                    reply(item.reply, Err(RejectError::Priority(pri).into()));
                    continue;
                }
                let _ = queue.push(item, pri);
            }
            Some(w) = wants.recv() => waiter = Some(w),
            else => return,
        }
    }
}

// --------------------
// Send side
// --------------------

/// Encrypted item being sent.
struct Prepared {
    orm: Arc<dyn OutboundRm>,
    rv: RvId,
    msg: Vec<u8>,
}

struct InFlight {
    rm: Arc<Prepared>,
    reply: Option<RmReply>,
}

enum Outcome {
    /// Acked by the server.
    Sent { next_invoice: String },
    /// Refused by the server; the caller gets the error.
    Rejected { err: RelayError, next_invoice: String },
    /// The session failed before an answer. Resend on the next session.
    Retry,
}

struct SendState {
    shared: Arc<Shared>,
    db: Arc<dyn RmqPersistence>,
    sess: Option<Session>,
    current: Option<InFlight>,
    want: Option<oneshot::Receiver<QueuedRm>>,
    invoice: String,
    attempt: Option<JoinHandle<()>>,
    generation: u64,
    outcome_tx: mpsc::Sender<(u64, Outcome)>,
    outcome_rx: mpsc::Receiver<(u64, Outcome)>,
}

impl SendState {
    fn new(shared: Arc<Shared>, db: Arc<dyn RmqPersistence>) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::channel(1);
        Self {
            shared,
            db,
            sess: None,
            current: None,
            want: None,
            invoice: String::new(),
            attempt: None,
            generation: 0,
            outcome_tx,
            outcome_rx,
        }
    }

    async fn run(
        &mut self,
        sessions: &mut mpsc::Receiver<Option<Session>>,
        want_tx: &mpsc::Sender<oneshot::Sender<QueuedRm>>,
    ) {
        loop {
            if self.current.is_none() && self.sess.is_some() && self.want.is_none() {
                let (tx, rx) = oneshot::channel();
                if want_tx.send(tx).await.is_err() {
                    return;
                }
                self.want = Some(rx);
            }

            tokio::select! {
                sess = sessions.recv() => match sess {
                    Some(sess) => self.bind(sess),
                    None => return,
                },
                item = next_item(&mut self.want) => match item {
                    Some(item) => self.prepare(item),
                    None => return,
                },
                Some((generation, outcome)) = self.outcome_rx.recv() => {
                    if generation == self.generation {
                        self.attempt = None;
                        self.conclude(outcome);
                    }
                }
            }
        }
    }

    fn bind(&mut self, sess: Option<Session>) {
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.generation += 1;
        self.invoice.clear();

        match &sess {
            Some(s) => {
                let max = s.policy().max_msg_size;
                self.shared.max_msg_size.store(max, Ordering::Relaxed);
                info!(
                    remote = %s.remote_addr(),
                    max_push_invoices = s.policy().max_push_invoices,
                    "rmq bound to session"
                );
            }
            None => info!("rmq unbound from session"),
        }
        self.sess = sess;
        self.start_attempt();
    }

    fn prepare(&mut self, item: QueuedRm) {
        match item.orm.encrypted_msg() {
            Ok((rv, msg)) => {
                self.current = Some(InFlight {
                    rm: Arc::new(Prepared {
                        orm: item.orm,
                        rv,
                        msg,
                    }),
                    reply: item.reply,
                });
                self.start_attempt();
            }
            Err(e) => {
                warn!(error = %e, "unable to encrypt outbound message");
                self.finish(item.reply, Err(e));
            }
        }
    }

    fn start_attempt(&mut self) {
        let (Some(sess), Some(cur)) = (&self.sess, &self.current) else {
            return;
        };
        if self.attempt.is_some() {
            return;
        }
        let sess = sess.clone();
        let db = self.db.clone();
        let rm = cur.rm.clone();
        let invoice = std::mem::take(&mut self.invoice);
        let generation = self.generation;
        let outcome_tx = self.outcome_tx.clone();
        self.attempt = Some(tokio::spawn(
            async move {
                let outcome = deliver(sess, db, rm, invoice).await;
                let _ = outcome_tx.send((generation, outcome)).await;
            }
            .in_current_span(),
        ));
    }

    fn conclude(&mut self, outcome: Outcome) {
        let Some(cur) = self.current.take() else {
            return;
        };
        match outcome {
            Outcome::Sent { next_invoice } => {
                debug!(rv = %cur.rm.rv.short_log_id(), len = cur.rm.msg.len(), "sent RM");
                self.invoice = next_invoice;
                self.finish(cur.reply, Ok(()));
            }
            Outcome::Rejected { err, next_invoice } => {
                self.invoice = next_invoice;
                self.finish(cur.reply, Err(err));
            }
            Outcome::Retry => {
                // Held until the next session is bound.
                self.current = Some(cur);
            }
        }
    }

    fn finish(&mut self, sink: Option<RmReply>, res: Result<()>) {
        reply(sink, res);
        self.shared.resolved();
    }

    fn shutdown(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        if let Some(cur) = self.current.take() {
            reply(cur.reply, Err(exiting()));
        }
        if let Some(mut want) = self.want.take() {
            if let Ok(item) = want.try_recv() {
                reply(item.reply, Err(exiting()));
            }
        }
    }
}

async fn next_item(want: &mut Option<oneshot::Receiver<QueuedRm>>) -> Option<QueuedRm> {
    let rx = match want.as_mut() {
        Some(rx) => rx,
        None => return std::future::pending().await,
    };
    let item = rx.await.ok();
    *want = None;
    item
}

/// Pay for and push one message over `sess`.
async fn deliver(
    sess: Session,
    db: Arc<dyn RmqPersistence>,
    rm: Arc<Prepared>,
    mut invoice: String,
) -> Outcome {
    loop {
        let paid_id = match pay_for_rm(sess.as_ref(), db.as_ref(), &rm, &mut invoice).await {
            Ok(id) => id,
            Err(e) => {
                if !e.is_exiting() {
                    warn!(error = %e, "unable to pay for RM push; closing session");
                    sess.request_close(e);
                }
                return Outcome::Retry;
            }
        };

        let req = Payload::RouteMessage(RouteMessage {
            paid_invoice_id: paid_id,
            rendezvous: rm.rv,
            message: rm.msg.clone(),
        });
        let reply = match sess.request(req).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "RM push not acked");
                return Outcome::Retry;
            }
        };

        let (err, next_invoice) = match reply {
            Payload::RouteMessageReply(r) if r.error.is_empty() => {
                forget_payment(db.as_ref(), rm.rv).await;
                return Outcome::Sent {
                    next_invoice: r.next_invoice,
                };
            }
            Payload::RouteMessageReply(r) => (parse_server_error(&r.error), r.next_invoice),
            Payload::Ack(ack) => (
                RelayError::Application {
                    code: ack.error_code,
                    msg: ack.error,
                    non_fatal: ack.non_fatal,
                },
                String::new(),
            ),
            other => (
                ProtocolError::UnexpectedReply(other.command().to_string()).into(),
                String::new(),
            ),
        };

        if err == RelayError::Payment(PaymentError::InvoicePayment) {
            warn!(rv = %rm.rv.short_log_id(), "server rejected RM payment; retrying with a fresh invoice");
            forget_payment(db.as_ref(), rm.rv).await;
            invoice.clear();
            continue;
        }
        if err.is_exiting() {
            return Outcome::Retry;
        }
        warn!(error = %err, "RM push rejected; closing session");
        sess.request_close(err.clone());
        return Outcome::Rejected { err, next_invoice };
    }
}

async fn forget_payment(db: &dyn RmqPersistence, rv: RvId) {
    if let Err(e) = db.delete_rv_payment_attempt(rv).await {
        warn!(rv = %rv.short_log_id(), error = %e, "unable to delete push payment attempt");
    }
}

/// Pay for pushing `rm`, or find an earlier payment that is still valid.
/// Returns the id of a reused payment, empty when paid just now.
async fn pay_for_rm(
    sess: &dyn ServerSession,
    db: &dyn RmqPersistence,
    rm: &Prepared,
    invoice: &mut String,
) -> Result<Vec<u8>> {
    let pc = sess.pay_client();
    let amount = sess.policy().calc_push_cost(rm.msg.len() as u64)?;

    if let Some(id) = reusable_payment(sess, db, rm.rv).await {
        return Ok(id);
    }

    if !payments::is_usable(pc.as_ref(), invoice).await {
        *invoice = payments::fetch_invoice(sess, InvoiceAction::Push).await?;
    }
    let inv = std::mem::take(invoice);
    db.store_rv_payment_attempt(rm.rv, &inv, SystemTime::now()).await?;

    match pc.pay_invoice_amount(&inv, amount).await {
        Ok(fees) => {
            rm.orm.paid_for_rm(amount, fees);
            Ok(Vec::new())
        }
        Err(e) => {
            rm.orm.paid_for_rm(amount, 0);
            Err(e)
        }
    }
}

/// Id of a recorded payment for pushing to `rv` that settled and is still
/// within the server's push payment lifetime.
async fn reusable_payment(
    sess: &dyn ServerSession,
    db: &dyn RmqPersistence,
    rv: RvId,
) -> Option<Vec<u8>> {
    let (invoice, at) = match db.rv_payment_attempt(rv).await {
        Ok(Some((invoice, at))) if !invoice.is_empty() => (invoice, at),
        Ok(_) => return None,
        Err(e) => {
            warn!(rv = %rv.short_log_id(), error = %e, "unable to load push payment attempt");
            return None;
        }
    };

    let lifetime = sess.policy().push_payment_lifetime;
    let age = SystemTime::now().duration_since(at).unwrap_or_default();
    if age > lifetime {
        warn!(rv = %rv.short_log_id(), ?age, ?lifetime, "stored push payment attempt expired");
        return None;
    }

    let pc = sess.pay_client();
    match timeout(PAYMENT_COMPLETION_WAIT, pc.is_payment_completed(&invoice)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            warn!(rv = %rv.short_log_id(), error = %e, "stored push payment did not complete");
            return None;
        }
        Err(_) => {
            warn!(rv = %rv.short_log_id(), "stored push payment still in flight; paying again");
            return None;
        }
    }

    match pc.decode_invoice(&invoice).await {
        Ok(decoded) => {
            debug!(rv = %rv.short_log_id(), "reusing push payment");
            Some(decoded.id)
        }
        Err(e) => {
            warn!(rv = %rv.short_log_id(), error = %e, "unable to decode stored push invoice");
            None
        }
    }
}
