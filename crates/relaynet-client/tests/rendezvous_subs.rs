#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]


use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relaynet_client::intf::{PushHandler, Session};
use relaynet_client::rendezvous::{PushedRm, RvManager, SubPaidHandler};
use relaynet_client::session::TaggedSession;
use relaynet_core::error::{PaymentError, RejectError, Subsystem};
use relaynet_core::protocol::{
    GetInvoice, GetInvoiceReply, InvoiceAction, Message, Payload, PushRoutedMessage,
    SubscribeRoutedMessages, SubscribeRoutedMessagesReply,
};
use relaynet_core::{RelayError, RvId};

use mock_server::{kx_pair, MockServer};
use mocks::{params, rv, MemDb, MockPay, MOCK_SCHEME};

const HYSTERESIS: Duration = Duration::from_millis(500);

fn start_rvm(db: Arc<MemDb>) -> (RvManager, CancellationToken) {
    let (rvm, runner) = RvManager::new(db, HYSTERESIS);
    let cancel = CancellationToken::new();
    tokio::spawn(runner.run(cancel.clone()));
    (rvm, cancel)
}

fn start_session(
    pay: Arc<MockPay>,
    rvm: &RvManager,
) -> (Session, MockServer, JoinHandle<RelayError>) {
    let (kx, server) = kx_pair();
    let mut p = params(4, pay);
    p.push_handler = Some(Arc::new(rvm.clone()));
    let (sess, runner) = TaggedSession::new(kx, p);
    let run = tokio::spawn(runner.run(CancellationToken::new()));
    (Arc::new(sess), server, run)
}

fn spawn_subscribe(
    rvm: &RvManager,
    id: RvId,
    on_paid: Option<SubPaidHandler>,
) -> (JoinHandle<Result<(), RelayError>>, mpsc::Receiver<PushedRm>) {
    let (tx, rx) = mpsc::channel(4);
    let rvm = rvm.clone();
    let task = tokio::spawn(async move { rvm.subscribe(id, Arc::new(tx), on_paid).await });
    (task, rx)
}

async fn serve_sub_invoice(server: &mut MockServer, invoice: &str) {
    let (msg, payload) = server.recv_request().await;
    assert_eq!(
        payload,
        Payload::GetInvoice(GetInvoice {
            payment_scheme: MOCK_SCHEME.into(),
            action: InvoiceAction::Sub,
        })
    );
    server
        .send(
            msg.tag,
            Payload::GetInvoiceReply(GetInvoiceReply {
                invoice: invoice.into(),
            }),
        )
        .await;
}

async fn recv_update(server: &mut MockServer) -> (Message, SubscribeRoutedMessages) {
    let (msg, payload) = server.recv_request().await;
    match payload {
        Payload::SubscribeRoutedMessages(req) => (msg, req),
        other => panic!("expected subscription update, got {}", other.command()),
    }
}

async fn update_reply(server: &mut MockServer, tag: u32, error: &str) {
    server
        .send(
            tag,
            Payload::SubscribeRoutedMessagesReply(SubscribeRoutedMessagesReply {
                next_invoice: String::new(),
                error: error.into(),
            }),
        )
        .await;
}

async fn settle(rvm: &RvManager) {
    for _ in 0..100 {
        if rvm.is_up_to_date() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("rendezvous manager never caught up");
}

#[tokio::test(start_paused = true)]
async fn subscription_paid_then_registered() {
    let db = Arc::new(MemDb::default());
    let (rvm, _cancel) = start_rvm(db.clone());
    let pay = MockPay::with_fees(5);
    let (sess, mut server, _run) = start_session(pay.clone(), &rvm);
    rvm.bind_to_session(Some(sess)).await.unwrap();
    settle(&rvm).await;

    let fees = Arc::new(Mutex::new(Vec::<(u64, u64)>::new()));
    let on_paid: SubPaidHandler = {
        let fees = fees.clone();
        Arc::new(move |amount: u64, fee: u64| fees.lock().unwrap().push((amount, fee)))
    };
    let (sub, _rx) = spawn_subscribe(&rvm, rv(1), Some(on_paid));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!rvm.is_up_to_date());

    serve_sub_invoice(&mut server, "sub-1").await;
    let (msg, req) = recv_update(&mut server).await;
    assert_eq!(req.add_rendezvous, vec![rv(1)]);
    assert!(req.del_rendezvous.is_empty());
    assert!(!db.is_paid(&rv(1)), "recorded before the server acked");
    update_reply(&mut server, msg.tag, "").await;

    assert_eq!(sub.await.unwrap(), Ok(()));
    assert_eq!(pay.paid(), vec![("sub-1".to_string(), 1000)]);
    assert_eq!(*fees.lock().unwrap(), vec![(1000, 5)]);
    assert!(db.is_paid(&rv(1)));
    settle(&rvm).await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_within_window_sends_nothing() {
    let db = Arc::new(MemDb::default());
    let (rvm, _cancel) = start_rvm(db);
    let (sess, mut server, _run) = start_session(MockPay::with_fees(0), &rvm);
    rvm.bind_to_session(Some(sess)).await.unwrap();

    let (sub, _rx) = spawn_subscribe(&rvm, rv(2), None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    rvm.unsubscribe(rv(2)).await.unwrap();

    assert_eq!(
        sub.await.unwrap(),
        Err(RejectError::SubscriptionCanceled(rv(2)).into())
    );
    assert!(server.try_recv_request(Duration::from_secs(2)).await.is_none());
    assert!(rvm.is_up_to_date());
}

#[tokio::test(start_paused = true)]
async fn unpaid_reply_waits_for_next_session() {
    let db = Arc::new(MemDb::default());
    db.paid.lock().unwrap().insert(rv(3));
    let (rvm, _cancel) = start_rvm(db.clone());
    let pay = MockPay::with_fees(0);
    let (sess, mut server, run) = start_session(pay.clone(), &rvm);
    // Keep the session alive after the manager drops it, as ConnKeeper does.
    let _keep = sess.clone();
    rvm.bind_to_session(Some(sess)).await.unwrap();

    let (sub, _rx) = spawn_subscribe(&rvm, rv(3), None);

    // Recorded as paid locally, so no invoice is requested first.
    let (msg, req) = recv_update(&mut server).await;
    assert_eq!(req.add_rendezvous, vec![rv(3)]);
    let unpaid = PaymentError::UnpaidSubscription(rv(3)).to_string();
    update_reply(&mut server, msg.tag, &unpaid).await;

    assert!(server.try_recv_request(Duration::from_secs(5)).await.is_none());
    assert!(!sub.is_finished());
    assert!(!rvm.is_up_to_date());
    assert_eq!(*db.marked_unpaid.lock().unwrap(), vec![rv(3)]);
    assert!(pay.paid().is_empty());
    assert!(!run.is_finished());

    let (next, mut server, _run) = start_session(pay.clone(), &rvm);
    rvm.bind_to_session(Some(next)).await.unwrap();
    serve_sub_invoice(&mut server, "sub-2").await;
    let (msg, req) = recv_update(&mut server).await;
    assert_eq!(req.add_rendezvous, vec![rv(3)]);
    update_reply(&mut server, msg.tag, "").await;

    assert_eq!(sub.await.unwrap(), Ok(()));
    assert_eq!(pay.paid(), vec![("sub-2".to_string(), 1000)]);
    assert!(db.is_paid(&rv(3)));
}

#[tokio::test(start_paused = true)]
async fn repeated_unpaid_reply_pays_once_per_session() {
    let db = Arc::new(MemDb::default());
    let (rvm, _cancel) = start_rvm(db.clone());
    let pay = MockPay::with_fees(0);
    let unpaid = PaymentError::UnpaidSubscription(rv(15)).to_string();

    let (sub, _rx) = spawn_subscribe(&rvm, rv(15), None);
    for round in 1..=3 {
        let (sess, mut server, _run) = start_session(pay.clone(), &rvm);
        // Keep the session alive after the manager drops it, as ConnKeeper does.
        let _keep = sess.clone();
        rvm.bind_to_session(Some(sess)).await.unwrap();
        serve_sub_invoice(&mut server, &format!("sub-{round}")).await;
        let (msg, _) = recv_update(&mut server).await;
        update_reply(&mut server, msg.tag, &unpaid).await;

        assert!(server.try_recv_request(Duration::from_secs(5)).await.is_none());
        assert_eq!(pay.paid().len(), round);
    }
    assert!(!sub.is_finished());
    assert!(!db.is_paid(&rv(15)));
}

#[tokio::test(start_paused = true)]
async fn duplicate_and_unknown_ids_rejected() {
    let (rvm, _cancel) = start_rvm(Arc::new(MemDb::default()));

    let (first, _rx) = spawn_subscribe(&rvm, rv(4), None);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let (tx, _rx2) = mpsc::channel(1);
    assert_eq!(
        rvm.subscribe(rv(4), Arc::new(tx), None).await,
        Err(RejectError::AlreadySubscribed(rv(4)).into())
    );
    assert_eq!(
        rvm.unsubscribe(rv(9)).await,
        Err(RejectError::NotSubscribed(rv(9)).into())
    );

    rvm.unsubscribe(rv(4)).await.unwrap();
    assert!(first.await.unwrap().is_err());
}

#[tokio::test(start_paused = true)]
async fn pushed_message_reaches_subscriber() {
    let db = Arc::new(MemDb::default());
    let (rvm, _cancel) = start_rvm(db);
    let (sess, mut server, _run) = start_session(MockPay::with_fees(0), &rvm);
    rvm.bind_to_session(Some(sess)).await.unwrap();

    let (sub, mut rx) = spawn_subscribe(&rvm, rv(5), None);
    serve_sub_invoice(&mut server, "sub-1").await;
    let (msg, _) = recv_update(&mut server).await;
    update_reply(&mut server, msg.tag, "").await;
    sub.await.unwrap().unwrap();

    let push = |id: RvId| {
        Payload::PushRoutedMessage(PushRoutedMessage {
            payload: b"sealed".to_vec(),
            rv: id,
            timestamp: 1_700_000_000,
            error: String::new(),
        })
    };
    server.send(11, push(rv(5))).await;
    let got = rx.recv().await.unwrap();
    assert_eq!(got.payload, b"sealed");
    assert_eq!(got.timestamp, UNIX_EPOCH + Duration::from_secs(1_700_000_000));

    let (msg, payload) = server.recv_request().await;
    assert_eq!(msg.tag, 11);
    assert_eq!(payload, Payload::Ack(Default::default()));

    // Unknown ids are acked and dropped.
    server.send(12, push(rv(6))).await;
    let (msg, payload) = server.recv_request().await;
    assert_eq!(msg.tag, 12);
    assert_eq!(payload, Payload::Ack(Default::default()));
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn pushed_errors_and_empty_payloads() {
    let (rvm, _cancel) = start_rvm(Arc::new(MemDb::default()));

    let empty = PushRoutedMessage {
        payload: Vec::new(),
        rv: rv(1),
        timestamp: 0,
        error: String::new(),
    };
    assert_eq!(rvm.handle_pushed(empty.clone()).await, Ok(()));

    let failed = PushRoutedMessage {
        error: "storage failure".into(),
        ..empty
    };
    let err = rvm.handle_pushed(failed).await.unwrap_err();
    assert!(err.is_fatal_to_session());
    assert!(err.to_string().contains("storage failure"));
}

#[tokio::test(start_paused = true)]
async fn rebind_resends_full_set() {
    let db = Arc::new(MemDb::default());
    let (rvm, _cancel) = start_rvm(db);
    let pay = MockPay::with_fees(0);

    let (first, mut server, _run) = start_session(pay.clone(), &rvm);
    rvm.bind_to_session(Some(first)).await.unwrap();
    let (sub, _rx) = spawn_subscribe(&rvm, rv(7), None);
    serve_sub_invoice(&mut server, "sub-1").await;
    let (msg, _) = recv_update(&mut server).await;
    update_reply(&mut server, msg.tag, "").await;
    sub.await.unwrap().unwrap();

    rvm.bind_to_session(None).await.unwrap();
    drop(server);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!rvm.is_up_to_date());

    let (second, mut server, _run) = start_session(pay.clone(), &rvm);
    rvm.bind_to_session(Some(second)).await.unwrap();
    let (msg, req) = recv_update(&mut server).await;
    assert_eq!(req.add_rendezvous, vec![rv(7)]);
    update_reply(&mut server, msg.tag, "").await;
    settle(&rvm).await;

    // Already paid within the expiration window: no second payment.
    assert_eq!(pay.paid().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_of_active_id_waits_for_server() {
    let (rvm, _cancel) = start_rvm(Arc::new(MemDb::default()));
    let (sess, mut server, _run) = start_session(MockPay::with_fees(0), &rvm);
    rvm.bind_to_session(Some(sess)).await.unwrap();

    let (sub, _rx) = spawn_subscribe(&rvm, rv(8), None);
    serve_sub_invoice(&mut server, "sub-1").await;
    let (msg, _) = recv_update(&mut server).await;
    update_reply(&mut server, msg.tag, "").await;
    sub.await.unwrap().unwrap();

    let unsub = {
        let rvm = rvm.clone();
        tokio::spawn(async move { rvm.unsubscribe(rv(8)).await })
    };
    let (msg, req) = recv_update(&mut server).await;
    assert!(req.add_rendezvous.is_empty());
    assert_eq!(req.del_rendezvous, vec![rv(8)]);
    assert!(!unsub.is_finished());
    update_reply(&mut server, msg.tag, "").await;
    assert_eq!(unsub.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn prepay_marks_paid_without_subscribing() {
    let db = Arc::new(MemDb::default());
    let (rvm, _cancel) = start_rvm(db.clone());
    let pay = MockPay::with_fees(7);
    let (sess, mut server, _run) = start_session(pay.clone(), &rvm);
    rvm.bind_to_session(Some(sess)).await.unwrap();

    let fees = Arc::new(Mutex::new(Vec::<(u64, u64)>::new()));
    let on_paid: SubPaidHandler = {
        let fees = fees.clone();
        Arc::new(move |amount: u64, fee: u64| fees.lock().unwrap().push((amount, fee)))
    };
    let prepay = {
        let rvm = rvm.clone();
        tokio::spawn(async move { rvm.prepay_rv_sub(rv(10), Some(on_paid)).await })
    };
    serve_sub_invoice(&mut server, "sub-1").await;
    let (msg, req) = recv_update(&mut server).await;
    assert!(req.add_rendezvous.is_empty());
    assert_eq!(req.mark_paid, vec![rv(10)]);
    assert_eq!(*fees.lock().unwrap(), vec![(1000, 7)]);
    assert!(!db.is_paid(&rv(10)));
    update_reply(&mut server, msg.tag, "").await;

    assert_eq!(prepay.await.unwrap(), Ok(()));
    assert!(db.is_paid(&rv(10)));
    settle(&rvm).await;
}

#[tokio::test(start_paused = true)]
async fn refused_update_fails_subscriber_and_closes_session() {
    let db = Arc::new(MemDb::default());
    let (rvm, _cancel) = start_rvm(db.clone());
    let (sess, mut server, run) = start_session(MockPay::with_fees(0), &rvm);
    rvm.bind_to_session(Some(sess)).await.unwrap();

    let (sub, _rx) = spawn_subscribe(&rvm, rv(11), None);
    serve_sub_invoice(&mut server, "sub-1").await;
    let (msg, _) = recv_update(&mut server).await;
    update_reply(&mut server, msg.tag, "too many subscriptions").await;

    let want = RelayError::ack("too many subscriptions");
    assert_eq!(sub.await.unwrap(), Err(want.clone()));
    assert_eq!(run.await.unwrap(), want);
    // Paid for, but never recorded since the server did not take it.
    assert!(!db.is_paid(&rv(11)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_waiters() {
    let (rvm, cancel) = start_rvm(Arc::new(MemDb::default()));
    let (sub, _rx) = spawn_subscribe(&rvm, rv(12), None);
    tokio::time::sleep(Duration::from_millis(10)).await;

    cancel.cancel();
    assert_eq!(
        sub.await.unwrap(),
        Err(RelayError::Exiting(Subsystem::RvManager))
    );
    let (tx, _rx) = mpsc::channel(1);
    assert!(rvm
        .subscribe(rv(13), Arc::new(tx), None)
        .await
        .unwrap_err()
        .is_exiting());
}

#[tokio::test(start_paused = true)]
async fn fetch_prepaid_returns_first_message_then_unsubscribes() {
    let db = Arc::new(MemDb::default());
    db.paid.lock().unwrap().insert(rv(14));
    let (rvm, _cancel) = start_rvm(db);
    let (sess, mut server, _run) = start_session(MockPay::with_fees(0), &rvm);
    rvm.bind_to_session(Some(sess)).await.unwrap();

    let fetch = {
        let rvm = rvm.clone();
        tokio::spawn(async move { rvm.fetch_prepaid_rv(rv(14)).await })
    };
    let (msg, req) = recv_update(&mut server).await;
    assert_eq!(req.add_rendezvous, vec![rv(14)]);
    update_reply(&mut server, msg.tag, "").await;

    server
        .send(
            3,
            Payload::PushRoutedMessage(PushRoutedMessage {
                payload: b"invite".to_vec(),
                rv: rv(14),
                timestamp: 0,
                error: String::new(),
            }),
        )
        .await;
    let (msg, payload) = server.recv_request().await;
    assert_eq!((msg.tag, payload.command()), (3, "ack"));

    let (msg, req) = recv_update(&mut server).await;
    assert_eq!(req.del_rendezvous, vec![rv(14)]);
    update_reply(&mut server, msg.tag, "").await;

    let got = fetch.await.unwrap().unwrap();
    assert_eq!(got.rv, rv(14));
    assert_eq!(got.payload, b"invite");
}

#[tokio::test(start_paused = true)]
async fn fetch_prepaid_never_pays_and_fails_when_unpaid() {
    let db = Arc::new(MemDb::default());
    let (rvm, _cancel) = start_rvm(db.clone());
    let pay = MockPay::with_fees(0);
    let (sess, mut server, run) = start_session(pay.clone(), &rvm);
    rvm.bind_to_session(Some(sess)).await.unwrap();

    let fetch = {
        let rvm = rvm.clone();
        tokio::spawn(async move { rvm.fetch_prepaid_rv(rv(20)).await })
    };
    // No invoice requested even though the database has no record of it.
    let (msg, req) = recv_update(&mut server).await;
    assert_eq!(req.add_rendezvous, vec![rv(20)]);
    let unpaid = PaymentError::UnpaidSubscription(rv(20)).to_string();
    update_reply(&mut server, msg.tag, &unpaid).await;

    assert_eq!(
        fetch.await.unwrap(),
        Err(PaymentError::UnpaidSubscription(rv(20)).into())
    );
    assert!(pay.paid().is_empty());
    assert!(db.marked_unpaid.lock().unwrap().is_empty());
    settle(&rvm).await;
    assert!(!run.is_finished());
}
