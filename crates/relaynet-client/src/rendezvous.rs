//! Rendezvous subscription manager.
//!
//! Keeps the server's set of subscribed rendezvous points in sync with
//! local demand. Local changes are batched behind a short hysteresis timer
//! and sent as a single net add/remove update; at most one update is in
//! flight. New subscriptions are paid for before they are sent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use relaynet_core::error::{
    parse_server_error, ProtocolError, RejectError, RelayError, Result, Subsystem,
};
use relaynet_core::protocol::{
    InvoiceAction, Payload, PushRoutedMessage, SubscribeRoutedMessages,
    SubscribeRoutedMessagesReply,
};
use relaynet_core::RvId;

use crate::intf::{PushHandler, RvPersistence, ServerSession, Session};
use crate::payments;
use crate::timer::WakeTimer;

/// A message delivered on a subscribed rendezvous point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedRm {
    pub rv: RvId,
    pub payload: Vec<u8>,
    /// Server-side timestamp of the push.
    pub timestamp: SystemTime,
}

/// Receives messages pushed on one rendezvous point. An error is acked to
/// the server with the error text.
#[async_trait]
pub trait RvHandler: Send + Sync {
    async fn handle_rm(&self, msg: PushedRm) -> Result<()>;
}

/// Forwards messages to a channel, dropping them when the channel is full
/// or closed.
#[async_trait]
impl RvHandler for mpsc::Sender<PushedRm> {
    async fn handle_rm(&self, msg: PushedRm) -> Result<()> {
        if self.try_send(msg).is_err() {
            debug!("dropping pushed message: receiver unavailable");
        }
        Ok(())
    }
}

/// Called with `(amount, fees)` in milliatoms once a subscription is paid.
pub type SubPaidHandler = Arc<dyn Fn(u64, u64) + Send + Sync>;

type Waiter = oneshot::Sender<Result<()>>;

enum Cmd {
    Subscribe {
        rv: RvId,
        handler: Arc<dyn RvHandler>,
        on_paid: Option<SubPaidHandler>,
        prepaid: bool,
        reply: Waiter,
    },
    Unsubscribe {
        rv: RvId,
        reply: Waiter,
    },
    Prepay {
        rv: RvId,
        on_paid: Option<SubPaidHandler>,
        reply: Waiter,
    },
    Lookup {
        rv: RvId,
        reply: oneshot::Sender<Option<Arc<dyn RvHandler>>>,
    },
    Bind(Option<Session>),
}

fn exiting() -> RelayError {
    RelayError::Exiting(Subsystem::RvManager)
}

#[derive(Clone)]
pub struct RvManager {
    cmd_tx: mpsc::Sender<Cmd>,
    up_to_date: watch::Receiver<bool>,
    done: CancellationToken,
}

impl std::fmt::Debug for RvManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RvManager")
            .field("up_to_date", &self.is_up_to_date())
            .finish()
    }
}

impl RvManager {
    /// `hysteresis` is how long local changes accumulate before an update
    /// is sent.
    pub fn new(db: Arc<dyn RvPersistence>, hysteresis: Duration) -> (RvManager, RvManagerRunner) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (up_tx, up_to_date) = watch::channel(true);
        let done = CancellationToken::new();
        let runner = RvManagerRunner {
            cmd_rx,
            state: State::new(db, hysteresis, up_tx),
            done: done.clone(),
        };
        (
            RvManager {
                cmd_tx,
                up_to_date,
                done,
            },
            runner,
        )
    }

    async fn call<T>(&self, cmd: Cmd, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        tokio::select! {
            r = self.cmd_tx.send(cmd) => r.map_err(|_| exiting())?,
            _ = self.done.cancelled() => return Err(exiting()),
        }
        rx.await.unwrap_or_else(|_| Err(exiting()))
    }

    /// Subscribe to `rv`. Returns once the server has acknowledged the
    /// subscription.
    pub async fn subscribe(
        &self,
        rv: RvId,
        handler: Arc<dyn RvHandler>,
        on_paid: Option<SubPaidHandler>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let cmd = Cmd::Subscribe {
            rv,
            handler,
            on_paid,
            prepaid: false,
            reply,
        };
        self.call(cmd, rx).await
    }

    /// Unsubscribe from `rv`. Returns once the server no longer holds the
    /// subscription.
    pub async fn unsubscribe(&self, rv: RvId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.call(Cmd::Unsubscribe { rv, reply }, rx).await
    }

    /// Pay for `rv` on the server without subscribing to it. `on_paid` is
    /// called if a payment was actually made.
    pub async fn prepay_rv_sub(&self, rv: RvId, on_paid: Option<SubPaidHandler>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.call(Cmd::Prepay { rv, on_paid, reply }, rx).await
    }

    /// Subscribe to `rv`, wait for its first message, then unsubscribe.
    ///
    /// The id must have been paid for already (see [`prepay_rv_sub`]): no
    /// payment is made, and a server reporting it unpaid fails the fetch
    /// with `UnpaidSubscription`.
    ///
    /// [`prepay_rv_sub`]: RvManager::prepay_rv_sub
    pub async fn fetch_prepaid_rv(&self, rv: RvId) -> Result<PushedRm> {
        let (tx, mut rx) = mpsc::channel(1);
        let (reply, acked) = oneshot::channel();
        let cmd = Cmd::Subscribe {
            rv,
            handler: Arc::new(tx),
            on_paid: None,
            prepaid: true,
            reply,
        };
        self.call(cmd, acked).await?;
        let msg = tokio::select! {
            m = rx.recv() => m.ok_or_else(exiting),
            _ = self.done.cancelled() => Err(exiting()),
        };
        if let Err(e) = self.unsubscribe(rv).await {
            debug!(rv = %rv.short_log_id(), error = %e, "unable to unsubscribe fetched rv");
        }
        msg
    }

    pub async fn bind_to_session(&self, sess: Option<Session>) -> Result<()> {
        tokio::select! {
            r = self.cmd_tx.send(Cmd::Bind(sess)) => r.map_err(|_| exiting()),
            _ = self.done.cancelled() => Err(exiting()),
        }
    }

    /// Whether every local change has been acknowledged by the server.
    pub fn is_up_to_date(&self) -> bool {
        *self.up_to_date.borrow()
    }

    async fn lookup(&self, rv: RvId) -> Result<Option<Arc<dyn RvHandler>>> {
        let (reply, rx) = oneshot::channel();
        tokio::select! {
            r = self.cmd_tx.send(Cmd::Lookup { rv, reply }) => r.map_err(|_| exiting())?,
            _ = self.done.cancelled() => return Err(exiting()),
        }
        rx.await.map_err(|_| exiting())
    }
}

#[async_trait]
impl PushHandler for RvManager {
    async fn handle_pushed(&self, msg: PushRoutedMessage) -> Result<()> {
        if !msg.error.is_empty() {
            return Err(RelayError::ack(format!(
                "error in pushed message for rv {}: {}",
                msg.rv.short_log_id(),
                msg.error
            )));
        }
        if msg.payload.is_empty() {
            debug!(rv = %msg.rv.short_log_id(), "empty pushed message");
            return Ok(());
        }

        let Some(handler) = self.lookup(msg.rv).await? else {
            warn!(rv = %msg.rv.short_log_id(), "pushed message for unsubscribed rv");
            return Ok(());
        };

        let timestamp = if msg.timestamp <= 0 {
            SystemTime::now()
        } else {
            UNIX_EPOCH + Duration::from_secs(msg.timestamp as u64)
        };
        handler
            .handle_rm(PushedRm {
                rv: msg.rv,
                payload: msg.payload,
                timestamp,
            })
            .await
    }
}

// --------------------
// Coordinating loop
// --------------------

pub struct RvManagerRunner {
    cmd_rx: mpsc::Receiver<Cmd>,
    state: State,
    done: CancellationToken,
}

impl RvManagerRunner {
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let RvManagerRunner {
            mut cmd_rx,
            mut state,
            done,
        } = self;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => state.handle(cmd),
                    None => break,
                },
                _ = state.timer.fired() => state.send_update(),
                Some((generation, outcome)) = state.outcome_rx.recv() => {
                    if generation == state.generation {
                        state.conclude(outcome);
                    }
                }
                _ = cancel.cancelled() => break,
            }
            state.publish();
        }

        done.cancel();
        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                Cmd::Subscribe { reply, .. }
                | Cmd::Unsubscribe { reply, .. }
                | Cmd::Prepay { reply, .. } => {
                    let _ = reply.send(Err(exiting()));
                }
                Cmd::Lookup { .. } | Cmd::Bind(_) => {}
            }
        }
        state.shutdown();
        debug!("rendezvous manager exiting");
        Ok(())
    }
}

struct Sub {
    handler: Arc<dyn RvHandler>,
    on_paid: Option<SubPaidHandler>,
    /// Already paid for on the server; never paid for here.
    prepaid: bool,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct Prepay {
    on_paid: Option<SubPaidHandler>,
    waiters: Vec<Waiter>,
}

struct InFlight {
    adds: Vec<RvId>,
    dels: Vec<RvId>,
    mark_paid: Vec<RvId>,
    task: JoinHandle<()>,
}

enum Outcome {
    Acked { next_invoice: String },
    /// Server reported `rv` unpaid. Nothing was applied.
    Unpaid { rv: RvId, err: RelayError },
    /// Server refused the update. Nothing was applied.
    Refused { err: RelayError, next_invoice: String },
    /// The session failed. Everything is resent on the next session.
    Failed,
}

struct State {
    db: Arc<dyn RvPersistence>,
    hysteresis: Duration,
    sess: Option<Session>,
    /// Locally wanted subscriptions.
    subs: HashMap<RvId, Sub>,
    /// Subscriptions the server holds for the bound session.
    server: HashSet<RvId>,
    unsub_waiters: HashMap<RvId, Vec<Waiter>>,
    prepays: HashMap<RvId, Prepay>,
    inflight: Option<InFlight>,
    invoice: String,
    timer: WakeTimer,
    generation: u64,
    outcome_tx: mpsc::Sender<(u64, Outcome)>,
    outcome_rx: mpsc::Receiver<(u64, Outcome)>,
    up_tx: watch::Sender<bool>,
}

impl State {
    fn new(db: Arc<dyn RvPersistence>, hysteresis: Duration, up_tx: watch::Sender<bool>) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::channel(1);
        Self {
            db,
            hysteresis,
            sess: None,
            subs: HashMap::new(),
            server: HashSet::new(),
            unsub_waiters: HashMap::new(),
            prepays: HashMap::new(),
            inflight: None,
            invoice: String::new(),
            timer: WakeTimer::new(),
            generation: 0,
            outcome_tx,
            outcome_rx,
            up_tx,
        }
    }

    fn handle(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Subscribe {
                rv,
                handler,
                on_paid,
                prepaid,
                reply,
            } => {
                if self.subs.contains_key(&rv) {
                    let _ = reply.send(Err(RejectError::AlreadySubscribed(rv).into()));
                    return;
                }
                // Supersedes a pending unsubscribe.
                for w in self.unsub_waiters.remove(&rv).unwrap_or_default() {
                    let _ = w.send(Ok(()));
                }
                let active = self.server.contains(&rv);
                let mut waiters = Vec::new();
                if active {
                    let _ = reply.send(Ok(()));
                } else {
                    waiters.push(reply);
                    self.timer.schedule(self.hysteresis);
                }
                debug!(rv = %rv.short_log_id(), prepaid, "subscribing");
                self.subs.insert(
                    rv,
                    Sub {
                        handler,
                        on_paid,
                        prepaid,
                        waiters,
                    },
                );
            }
            Cmd::Unsubscribe { rv, reply } => {
                let Some(sub) = self.subs.remove(&rv) else {
                    let _ = reply.send(Err(RejectError::NotSubscribed(rv).into()));
                    return;
                };
                for w in sub.waiters {
                    let _ = w.send(Err(RejectError::SubscriptionCanceled(rv).into()));
                }
                debug!(rv = %rv.short_log_id(), "unsubscribing");
                if self.server.contains(&rv) || self.inflight_adds(&rv) {
                    self.unsub_waiters.entry(rv).or_default().push(reply);
                    self.timer.schedule(self.hysteresis);
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            Cmd::Prepay { rv, on_paid, reply } => {
                let prepay = self.prepays.entry(rv).or_default();
                if on_paid.is_some() {
                    prepay.on_paid = on_paid;
                }
                prepay.waiters.push(reply);
                self.timer.schedule(self.hysteresis);
            }
            Cmd::Lookup { rv, reply } => {
                let _ = reply.send(self.subs.get(&rv).map(|s| s.handler.clone()));
            }
            Cmd::Bind(sess) => self.bind(sess),
        }
    }

    fn inflight_adds(&self, rv: &RvId) -> bool {
        self.inflight
            .as_ref()
            .map(|f| f.adds.contains(rv))
            .unwrap_or(false)
    }

    fn bind(&mut self, sess: Option<Session>) {
        if let Some(f) = self.inflight.take() {
            f.task.abort();
        }
        self.generation += 1;
        self.invoice.clear();
        // A new connection starts with no subscriptions.
        self.server.clear();
        for (_, waiters) in self.unsub_waiters.drain() {
            for w in waiters {
                let _ = w.send(Ok(()));
            }
        }

        match &sess {
            Some(s) => {
                info!(remote = %s.remote_addr(), subs = self.subs.len(), "rendezvous manager bound to session");
                self.timer.reset(Duration::ZERO);
            }
            None => {
                info!("rendezvous manager unbound from session");
                self.timer.cancel();
            }
        }
        self.sess = sess;
    }

    fn net_changes(&self) -> (Vec<RvId>, Vec<RvId>) {
        let adds = self
            .subs
            .keys()
            .filter(|rv| !self.server.contains(*rv))
            .copied()
            .collect();
        let dels = self
            .server
            .iter()
            .filter(|rv| !self.subs.contains_key(*rv))
            .copied()
            .collect();
        (adds, dels)
    }

    fn send_update(&mut self) {
        if self.inflight.is_some() {
            // Folded into the next update once the current one completes.
            return;
        }
        let Some(sess) = self.sess.clone() else {
            return;
        };

        let (adds, dels) = self.net_changes();
        let mark_paid: Vec<RvId> = self.prepays.keys().copied().collect();
        if adds.is_empty() && dels.is_empty() && mark_paid.is_empty() {
            return;
        }

        let mut need_pay = Vec::new();
        let mut hooks = HashMap::new();
        for rv in &adds {
            let Some(sub) = self.subs.get(rv) else {
                continue;
            };
            if sub.prepaid {
                continue;
            }
            need_pay.push(*rv);
            if let Some(h) = &sub.on_paid {
                hooks.insert(*rv, h.clone());
            }
        }
        for (rv, prepay) in &self.prepays {
            need_pay.push(*rv);
            if let Some(h) = &prepay.on_paid {
                hooks.insert(*rv, h.clone());
            }
        }

        let job = UpdateJob {
            sess,
            db: self.db.clone(),
            req: SubscribeRoutedMessages {
                add_rendezvous: adds.clone(),
                del_rendezvous: dels.clone(),
                mark_paid: mark_paid.clone(),
            },
            need_pay,
            hooks,
            invoice: std::mem::take(&mut self.invoice),
        };
        debug!(
            adds = adds.len(),
            dels = dels.len(),
            mark_paid = mark_paid.len(),
            "sending subscription update"
        );

        let generation = self.generation;
        let outcome_tx = self.outcome_tx.clone();
        let task = tokio::spawn(
            async move {
                let outcome = job.run().await;
                let _ = outcome_tx.send((generation, outcome)).await;
            }
            .in_current_span(),
        );
        self.inflight = Some(InFlight {
            adds,
            dels,
            mark_paid,
            task,
        });
    }

    fn conclude(&mut self, outcome: Outcome) {
        let Some(f) = self.inflight.take() else {
            return;
        };

        match outcome {
            Outcome::Acked { next_invoice } => {
                self.invoice = next_invoice;
                self.server.extend(f.adds.iter().copied());
                for rv in &f.dels {
                    self.server.remove(rv);
                }
                for rv in &f.mark_paid {
                    for w in self.prepays.remove(rv).unwrap_or_default().waiters {
                        let _ = w.send(Ok(()));
                    }
                }
                self.settle();
                if self.has_changes() {
                    self.timer.reset(Duration::ZERO);
                }
            }
            Outcome::Unpaid { rv, err } => match self.subs.get(&rv) {
                Some(sub) if sub.prepaid => {
                    warn!(rv = %rv.short_log_id(), "server reports prepaid rv as unpaid");
                    if let Some(sub) = self.subs.remove(&rv) {
                        for w in sub.waiters {
                            let _ = w.send(Err(err.clone()));
                        }
                    }
                    if self.has_changes() {
                        self.timer.schedule(self.hysteresis);
                    }
                }
                Some(_) => {
                    // Not retried on this session. The next bind resends
                    // the subscription and pays for it.
                    warn!(rv = %rv.short_log_id(), "server reports unpaid subscription; waiting for next session");
                    self.sess = None;
                    self.timer.cancel();
                }
                None => {
                    warn!(rv = %rv.short_log_id(), "server reports unpaid subscription for unknown rv");
                }
            },
            Outcome::Refused { err, next_invoice } => {
                self.invoice = next_invoice;
                for rv in &f.adds {
                    if let Some(sub) = self.subs.remove(rv) {
                        for w in sub.waiters {
                            let _ = w.send(Err(err.clone()));
                        }
                    }
                }
                for rv in &f.mark_paid {
                    for w in self.prepays.remove(rv).unwrap_or_default().waiters {
                        let _ = w.send(Err(err.clone()));
                    }
                }
            }
            Outcome::Failed => {}
        }
    }

    /// Resolve waiters whose request now matches the server's state.
    fn settle(&mut self) {
        for (rv, sub) in self.subs.iter_mut() {
            if self.server.contains(rv) {
                for w in sub.waiters.drain(..) {
                    let _ = w.send(Ok(()));
                }
            }
        }
        let server = &self.server;
        self.unsub_waiters.retain(|rv, waiters| {
            if server.contains(rv) {
                return true;
            }
            for w in waiters.drain(..) {
                let _ = w.send(Ok(()));
            }
            false
        });
    }

    fn has_changes(&self) -> bool {
        let (adds, dels) = self.net_changes();
        !adds.is_empty() || !dels.is_empty() || !self.prepays.is_empty()
    }

    fn publish(&self) {
        let up = self.inflight.is_none() && !self.has_changes();
        self.up_tx.send_if_modified(|cur| {
            let changed = *cur != up;
            *cur = up;
            changed
        });
    }

    fn shutdown(&mut self) {
        self.timer.cancel();
        if let Some(f) = self.inflight.take() {
            f.task.abort();
        }
        for (_, sub) in self.subs.drain() {
            for w in sub.waiters {
                let _ = w.send(Err(exiting()));
            }
        }
        let prepays = self.prepays.drain().map(|(_, p)| p.waiters);
        for waiters in self.unsub_waiters.drain().map(|(_, w)| w).chain(prepays) {
            for w in waiters {
                let _ = w.send(Err(exiting()));
            }
        }
    }
}

// --------------------
// Update request
// --------------------

struct UpdateJob {
    sess: Session,
    db: Arc<dyn RvPersistence>,
    req: SubscribeRoutedMessages,
    /// Ids that may need paying for: adds not marked prepaid, plus
    /// everything being marked paid.
    need_pay: Vec<RvId>,
    hooks: HashMap<RvId, SubPaidHandler>,
    invoice: String,
}

impl UpdateJob {
    async fn run(mut self) -> Outcome {
        let paid = match self.pay().await {
            Ok(paid) => paid,
            Err(e) => {
                if !e.is_exiting() {
                    warn!(error = %e, "unable to pay for subscriptions; closing session");
                    self.sess.request_close(e);
                }
                return Outcome::Failed;
            }
        };

        let reply = match self
            .sess
            .request(Payload::SubscribeRoutedMessages(self.req.clone()))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "subscription update not acked");
                return Outcome::Failed;
            }
        };

        let reply = match reply {
            Payload::SubscribeRoutedMessagesReply(r) => r,
            Payload::Ack(ack) => SubscribeRoutedMessagesReply {
                next_invoice: String::new(),
                error: ack.error,
            },
            other => {
                let err: RelayError =
                    ProtocolError::UnexpectedReply(other.command().to_string()).into();
                self.sess.request_close(err.clone());
                return Outcome::Refused {
                    err,
                    next_invoice: String::new(),
                };
            }
        };
        if reply.error.is_empty() {
            if let Err(e) = self.db.save_paid_rvs(&paid).await {
                warn!(error = %e, "unable to save paid rvs");
            }
            // Nothing was paid: the previous invoice is still unused.
            let next_invoice = if paid.is_empty() && reply.next_invoice.is_empty() {
                self.invoice
            } else {
                reply.next_invoice
            };
            return Outcome::Acked { next_invoice };
        }

        let err = parse_server_error(&reply.error);
        if let Some(rv) = err.unpaid_rv() {
            if self.need_pay.contains(&rv) {
                if let Err(e) = self.db.mark_rv_unpaid(rv).await {
                    warn!(rv = %rv.short_log_id(), error = %e, "unable to mark rv unpaid");
                }
            }
            return Outcome::Unpaid { rv, err };
        }
        if err.is_exiting() {
            return Outcome::Failed;
        }
        warn!(error = %err, "subscription update refused; closing session");
        self.sess.request_close(err.clone());
        Outcome::Refused {
            err,
            next_invoice: reply.next_invoice,
        }
    }

    /// Pay for whatever in `need_pay` the database does not record as
    /// paid. Returns the ids paid for; they are persisted only once the
    /// server acks the update.
    async fn pay(&mut self) -> Result<Vec<RvId>> {
        if self.need_pay.is_empty() {
            return Ok(Vec::new());
        }

        let unpaid = self
            .db
            .unpaid_rvs(&self.need_pay, self.sess.expiration_days())
            .await?;
        if unpaid.is_empty() {
            return Ok(unpaid);
        }

        let sess = self.sess.as_ref();
        let amount = sess.policy().calc_sub_cost(unpaid.len())?;
        let pc = sess.pay_client();
        if !payments::is_usable(pc.as_ref(), &self.invoice).await {
            self.invoice = payments::fetch_invoice(sess, InvoiceAction::Sub).await?;
        }
        let invoice = std::mem::take(&mut self.invoice);
        let fees = pc.pay_invoice_amount(&invoice, amount).await?;

        let (_, sub_rate) = sess.payment_rates();
        for (rv, fee) in unpaid.iter().zip(split_fees(fees, unpaid.len())) {
            if let Some(on_paid) = self.hooks.get(rv) {
                on_paid(sub_rate, fee);
            }
        }
        info!(count = unpaid.len(), amount, fees, "paid for rendezvous subscriptions");
        Ok(unpaid)
    }
}

/// Split `fees` evenly across `n` ids, the remainder going to the first.
fn split_fees(fees: u64, n: usize) -> Vec<u64> {
    if n == 0 {
        return Vec::new();
    }
    let mut shares = vec![fees / n as u64; n];
    if let Some(first) = shares.first_mut() {
        *first += fees % n as u64;
    }
    shares
}
