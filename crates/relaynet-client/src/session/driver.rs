use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};

use relaynet_core::error::{ProtocolError, RelayError, Result, Subsystem};
use relaynet_core::protocol::{
    decode, encode, Acknowledge, Message, Payload, Ping, PushRoutedMessage, CMD_ACK, CMD_PING,
};

use super::{SessionParams, WireMsg};
use crate::intf::{KxStream, MsgReader, MsgWriter, PushHandler, ReplySink};

/// How long the tagging loop waits for a free tag before logging that the
/// pool is exhausted and waiting again.
const TAG_WAIT: Duration = Duration::from_secs(1);

type Frame = Result<(Message, Payload)>;
type Registration = (u32, Option<ReplySink>);

pub struct SessionRunner {
    reader: Box<dyn MsgReader>,
    writer: Box<dyn MsgWriter>,
    remote_addr: String,
    tag_depth: u32,
    ping: PingCfg,
    push_handler: Option<Arc<dyn PushHandler>>,
    send_rx: mpsc::Receiver<WireMsg>,
    close_rx: mpsc::Receiver<RelayError>,
    done: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
struct PingCfg {
    interval: Duration,
    limit: Duration,
    tag: u32,
    log: bool,
}

impl SessionRunner {
    pub(super) fn new(
        kx: KxStream,
        params: SessionParams,
        send_rx: mpsc::Receiver<WireMsg>,
        close_rx: mpsc::Receiver<RelayError>,
        done: CancellationToken,
    ) -> Self {
        Self {
            reader: kx.reader,
            writer: kx.writer,
            remote_addr: kx.remote_addr,
            tag_depth: params.tag_depth,
            ping: PingCfg {
                interval: params.ping_interval,
                limit: params.policy.ping_limit,
                tag: params.tag_depth,
                log: params.log_pings,
            },
            push_handler: params.push_handler,
            send_rx,
            close_rx,
            done,
        }
    }

    /// Drive the session until the stream fails, a close is requested or
    /// `cancel` fires. Returns the reason. Every pending caller has been
    /// released with an exiting error by the time this returns.
    pub async fn run(self, cancel: CancellationToken) -> RelayError {
        let span = tracing::info_span!("session", remote = %self.remote_addr);
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(self, cancel: CancellationToken) -> RelayError {
        let SessionRunner {
            reader,
            mut writer,
            tag_depth,
            ping,
            push_handler,
            mut send_rx,
            mut close_rx,
            done,
            ..
        } = self;

        let pool = (tag_depth as usize).max(1);
        let (tags_tx, mut tags_rx) = mpsc::channel::<u32>(pool);
        for tag in 0..tag_depth {
            let _ = tags_tx.try_send(tag);
        }
        let (reg_tx, mut reg_rx) = mpsc::unbounded_channel::<Registration>();
        let (tagged_tx, mut tagged_rx) = mpsc::channel::<WireMsg>(1);
        let (ack_tx, mut ack_rx) = mpsc::channel::<WireMsg>(pool);
        let (pong_tx, mut pong_rx) = mpsc::channel::<()>(1);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<RelayError>(1);
        let (frames_tx, mut frames_rx) = mpsc::channel::<Frame>(1);

        let reader_task = tokio::spawn(read_frames(reader, frames_tx).in_current_span());
        let mut pending: HashMap<u32, Option<ReplySink>> = HashMap::new();

        let err = {
            let inbound = Inbound {
                frames: &mut frames_rx,
                registrations: &mut reg_rx,
                pending: &mut pending,
                tags: &tags_tx,
                pongs: &pong_tx,
                fatal: &mut fatal_rx,
                pushed: PushCtx {
                    handler: push_handler,
                    acks: ack_tx.clone(),
                    fatal: fatal_tx.clone(),
                    done: done.clone(),
                },
                log_pings: ping.log,
            };

            tokio::select! {
                e = tagging_loop(&mut tags_rx, &mut send_rx, &reg_tx, &tagged_tx) => e,
                e = send_loop(writer.as_mut(), &mut tagged_rx, &mut ack_rx, &mut pong_rx, ping) => e,
                e = inbound.run() => e,
                Some(reason) = close_rx.recv() => reason,
                _ = cancel.cancelled() => RelayError::CloseRequested("session canceled".into()),
            }
        };

        // ---- teardown: release every waiter
        done.cancel();
        reader_task.abort();
        send_rx.close();
        close_rx.close();
        ack_rx.close();

        while let Ok((tag, sink)) = reg_rx.try_recv() {
            pending.insert(tag, sink);
        }
        for (_, sink) in pending.drain() {
            if let Some(sink) = sink {
                let _ = sink.send(Err(RelayError::Exiting(Subsystem::SessionRecvLoop)));
            }
        }
        while let Ok(wm) = tagged_rx.try_recv() {
            fail_unsent(wm);
        }
        while let Ok(wm) = send_rx.try_recv() {
            fail_unsent(wm);
        }
        while let Ok(wm) = ack_rx.try_recv() {
            fail_unsent(wm);
        }
        drop(writer);

        debug!(error = %err, class = err.class().as_str(), "session terminated");
        err
    }
}

fn fail_unsent(wm: WireMsg) {
    let _ = wm
        .write_done
        .send(Err(RelayError::Exiting(Subsystem::SessionSendLoop)));
    if let Some(sink) = wm.reply {
        let _ = sink.send(Err(RelayError::Exiting(Subsystem::SessionRecvLoop)));
    }
}

// --------------------
// Tagging
// --------------------

/// Pairs each queued request with a free tag and registers its reply sink
/// with the receive side before handing it to the writer, so a reply can
/// never arrive for an unregistered tag.
async fn tagging_loop(
    tags: &mut mpsc::Receiver<u32>,
    requests: &mut mpsc::Receiver<WireMsg>,
    registrations: &mpsc::UnboundedSender<Registration>,
    out: &mpsc::Sender<WireMsg>,
) -> RelayError {
    let exiting = RelayError::Exiting(Subsystem::SessionSendLoop);
    loop {
        let tag = match timeout(TAG_WAIT, tags.recv()).await {
            Err(_) => {
                debug!("tagstack exhausted");
                continue;
            }
            Ok(Some(tag)) => tag,
            Ok(None) => return exiting,
        };

        let Some(mut wm) = requests.recv().await else {
            return exiting;
        };
        wm.msg.tag = tag;

        if registrations.send((tag, wm.reply.take())).is_err() {
            let _ = wm.write_done.send(Err(exiting.clone()));
            return exiting;
        }
        if let Err(mpsc::error::SendError(wm)) = out.send(wm).await {
            let _ = wm.write_done.send(Err(exiting.clone()));
            return exiting;
        }
    }
}

// --------------------
// Sending
// --------------------

async fn send_loop(
    writer: &mut dyn MsgWriter,
    tagged: &mut mpsc::Receiver<WireMsg>,
    acks: &mut mpsc::Receiver<WireMsg>,
    pongs: &mut mpsc::Receiver<()>,
    ping: PingCfg,
) -> RelayError {
    let pinging = !ping.interval.is_zero();
    let period = if pinging {
        ping.interval
    } else {
        Duration::from_secs(3600)
    };
    let mut ping_tick = interval_at(Instant::now() + period, period);
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut got_pong = true;
    let mut last_write = Instant::now();

    loop {
        let wm = tokio::select! {
            Some(()) = pongs.recv() => {
                got_pong = true;
                continue;
            }
            _ = ping_tick.tick(), if pinging => {
                if !got_pong {
                    return ProtocolError::PongTimeout.into();
                }
                got_pong = false;
                let mut msg = Message::new(CMD_PING);
                msg.tag = ping.tag;
                if ping.log {
                    trace!("sending ping");
                }
                let res = write_frame(writer, &mut last_write, &ping, msg, &Payload::Ping(Ping {})).await;
                if let Err(e) = res {
                    return e;
                }
                continue;
            }
            Some(wm) = tagged.recv() => wm,
            Some(wm) = acks.recv() => wm,
            else => return RelayError::Exiting(Subsystem::SessionSendLoop),
        };

        trace!(cmd = %wm.msg.command, tag = wm.msg.tag, "sending");
        let res = write_frame(writer, &mut last_write, &ping, wm.msg, &wm.payload).await;
        let failed = res.as_ref().err().cloned();
        let _ = wm.write_done.send(res);
        if let Some(e) = failed {
            return e;
        }
        // Only an idle stream is pinged.
        ping_tick.reset();
    }
}

async fn write_frame(
    writer: &mut dyn MsgWriter,
    last_write: &mut Instant,
    ping: &PingCfg,
    mut msg: Message,
    payload: &Payload,
) -> Result<()> {
    // A gap longer than the server's ping limit means the server has
    // already dropped us (typically after the host was suspended).
    let idle = last_write.elapsed();
    if !ping.interval.is_zero() && idle > ping.limit {
        return Err(ProtocolError::Stalled(idle).into());
    }

    msg.time_stamp = unix_now();
    let raw = encode(&msg, payload)?;
    writer.write_msg(raw).await?;
    *last_write = Instant::now();
    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

// --------------------
// Receiving
// --------------------

async fn read_frames(mut reader: Box<dyn MsgReader>, out: mpsc::Sender<Frame>) {
    loop {
        let frame = match reader.read_msg().await {
            Ok(raw) => decode(&raw),
            Err(e) => Err(e),
        };
        let failed = frame.is_err();
        if out.send(frame).await.is_err() || failed {
            return;
        }
    }
}

struct Inbound<'a> {
    frames: &'a mut mpsc::Receiver<Frame>,
    registrations: &'a mut mpsc::UnboundedReceiver<Registration>,
    pending: &'a mut HashMap<u32, Option<ReplySink>>,
    tags: &'a mpsc::Sender<u32>,
    pongs: &'a mpsc::Sender<()>,
    fatal: &'a mut mpsc::Receiver<RelayError>,
    pushed: PushCtx,
    log_pings: bool,
}

impl Inbound<'_> {
    async fn run(mut self) -> RelayError {
        loop {
            tokio::select! {
                biased;

                Some((tag, sink)) = self.registrations.recv() => {
                    self.pending.insert(tag, sink);
                }
                Some(e) = self.fatal.recv() => return e,
                frame = self.frames.recv() => {
                    let (msg, payload) = match frame {
                        Some(Ok(f)) => f,
                        Some(Err(e)) => return e,
                        None => return RelayError::Exiting(Subsystem::SessionRecvLoop),
                    };
                    if let Err(e) = self.dispatch(msg, payload) {
                        return e;
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, msg: Message, payload: Payload) -> Result<()> {
        match payload {
            Payload::Pong(_) => {
                if self.log_pings {
                    trace!("received pong");
                }
                let _ = self.pongs.try_send(());
            }
            Payload::PushRoutedMessage(pm) => {
                trace!(rv = %pm.rv.short_log_id(), tag = msg.tag, "received pushed message");
                self.pushed.spawn(msg.tag, pm);
            }
            reply => {
                while let Ok((tag, sink)) = self.registrations.try_recv() {
                    self.pending.insert(tag, sink);
                }
                let Some(sink) = self.pending.remove(&msg.tag) else {
                    return Err(ProtocolError::InvalidRecvTag {
                        cmd: msg.command,
                        tag: msg.tag,
                    }
                    .into());
                };
                trace!(cmd = %msg.command, tag = msg.tag, "received reply");
                let _ = self.tags.try_send(msg.tag);
                if let Some(sink) = sink {
                    let _ = sink.send(Ok(reply));
                }
            }
        }
        Ok(())
    }
}

/// Runs pushed-message handlers off the receive loop and writes their acks.
struct PushCtx {
    handler: Option<Arc<dyn PushHandler>>,
    acks: mpsc::Sender<WireMsg>,
    fatal: mpsc::Sender<RelayError>,
    done: CancellationToken,
}

impl PushCtx {
    fn spawn(&self, tag: u32, pm: PushRoutedMessage) {
        let handler = self.handler.clone();
        let acks = self.acks.clone();
        let fatal = self.fatal.clone();
        let done = self.done.clone();

        tokio::spawn(
            async move {
                let work = async {
                    let res = match handler {
                        Some(h) => h.handle_pushed(pm).await,
                        None => {
                            warn!(rv = %pm.rv.short_log_id(), "no handler for pushed message");
                            Ok(())
                        }
                    };

                    let mut ack = Acknowledge::default();
                    if let Err(e) = &res {
                        let (code, text) = e.ack_fields();
                        ack.error = text;
                        ack.error_code = code;
                        ack.non_fatal = !e.is_fatal_to_session();
                    }
                    let mut msg = Message::new(CMD_ACK);
                    msg.tag = tag;
                    let (tx, rx) = oneshot::channel();
                    let wm = WireMsg {
                        msg,
                        payload: Payload::Ack(ack),
                        write_done: tx,
                        reply: None,
                    };
                    if acks.send(wm).await.is_err() {
                        return;
                    }
                    let _ = rx.await;

                    if let Err(e) = res {
                        if e.is_fatal_to_session() {
                            warn!(error = %e, "pushed message handler failed; closing session");
                            let _ = fatal.send(e).await;
                        }
                    }
                };
                tokio::select! {
                    _ = work => {}
                    _ = done.cancelled() => {}
                }
            }
            .in_current_span(),
        );
    }
}
