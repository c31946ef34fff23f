//! End-to-end actor behavior against an in-process fake broker (spec §8).

mod common;

use common::{start_fake_broker, FakeBrokerConn};
use pulsar_producer_core::{
    BrokerFrame, Command, ConnectionState, Message, PartitionProducer, ProducerError,
    ProducerOptionsBuilder,
};
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn batch_of_one_sync_send_receives_its_receipt() {
    let (broker_url, listener) = start_fake_broker().await;
    let handle =
        PartitionProducer::spawn("persistent://p/ns/t-partition-0".into(), broker_url, Default::default())
            .unwrap();

    let mut broker = FakeBrokerConn::accept(&listener).await;
    broker.complete_handshake("standalone-0-1").await;

    let send_fut = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .send_sync(vec![Message::new(b"hello".to_vec())], Duration::from_secs(5))
                .await
        }
    });

    let sequence_id = match broker.recv_command().await {
        Command::Send {
            sequence_id,
            messages,
            ..
        } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].value.as_ref(), b"hello");
            sequence_id
        }
        other => panic!("expected Send, got {other:?}"),
    };
    broker
        .send(BrokerFrame::SendReceipt {
            producer_id: 0,
            sequence_id,
        })
        .await;

    let result = send_fut.await.unwrap();
    assert_eq!(result.unwrap(), sequence_id);

    handle.close().await;
}

#[tokio::test]
async fn send_sync_default_uses_the_configured_timeout_instead_of_a_per_call_one() {
    let (broker_url, listener) = start_fake_broker().await;
    let opts = ProducerOptionsBuilder::new()
        .sync_call_timeout(Duration::from_secs(5))
        .build();
    let handle =
        PartitionProducer::spawn("persistent://p/ns/t-partition-0".into(), broker_url, opts).unwrap();

    let mut broker = FakeBrokerConn::accept(&listener).await;
    broker.complete_handshake("standalone-0-1").await;

    let send_fut = tokio::spawn({
        let handle = handle.clone();
        async move { handle.send_sync_default(vec![Message::new(b"hello".to_vec())]).await }
    });

    let sequence_id = match broker.recv_command().await {
        Command::Send { sequence_id, .. } => sequence_id,
        other => panic!("expected Send, got {other:?}"),
    };
    broker
        .send(BrokerFrame::SendReceipt {
            producer_id: 0,
            sequence_id,
        })
        .await;

    let result = send_fut.await.unwrap();
    assert_eq!(result.unwrap(), sequence_id);

    handle.close().await;
}

#[tokio::test]
async fn three_coalesced_casts_become_one_batch_and_one_callback() {
    let (broker_url, listener) = start_fake_broker().await;
    let (cb_tx, mut cb_rx) = mpsc::unbounded_channel();
    let opts = ProducerOptionsBuilder::new()
        .batch_size(3)
        .callback(move |result| {
            let _ = cb_tx.send(result);
        })
        .build();
    let handle =
        PartitionProducer::spawn("persistent://p/ns/t-partition-0".into(), broker_url, opts).unwrap();

    let mut broker = FakeBrokerConn::accept(&listener).await;
    broker.complete_handshake("standalone-0-1").await;

    handle.send(vec![Message::new(b"a".to_vec())]);
    handle.send(vec![Message::new(b"b".to_vec())]);
    handle.send(vec![Message::new(b"c".to_vec())]);

    let sequence_id = match broker.recv_command().await {
        Command::Send {
            sequence_id,
            messages,
            ..
        } => {
            assert_eq!(messages.len(), 3, "all three casts should coalesce into one Send");
            sequence_id
        }
        other => panic!("expected Send, got {other:?}"),
    };
    broker
        .send(BrokerFrame::SendReceipt {
            producer_id: 0,
            sequence_id,
        })
        .await;

    let outcome = cb_rx.recv().await.unwrap().unwrap();
    assert_eq!(outcome.sequence_id, sequence_id);
    assert_eq!(outcome.message_count, 3);
    assert!(cb_rx.try_recv().is_err(), "callback must fire exactly once per batch");

    handle.close().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_mid_flight_is_resent_with_the_same_sequence_id_after_reconnect() {
    let (broker_url, listener) = start_fake_broker().await;
    let handle =
        PartitionProducer::spawn("persistent://p/ns/t-partition-0".into(), broker_url, Default::default())
            .unwrap();

    let mut broker = FakeBrokerConn::accept(&listener).await;
    broker.complete_handshake("standalone-0-1").await;

    let send_fut = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .send_sync(vec![Message::new(b"in-flight".to_vec())], Duration::from_secs(30))
                .await
        }
    });

    let first_sequence_id = match broker.recv_command().await {
        Command::Send { sequence_id, .. } => sequence_id,
        other => panic!("expected Send, got {other:?}"),
    };

    // Broker vanishes before acking.
    broker.disconnect().await;

    // Let the reader task observe the EOF and arm the 5s reconnect timer.
    tokio::time::advance(Duration::from_millis(10)).await;
    tokio::time::advance(Duration::from_secs(5)).await;

    let mut broker = FakeBrokerConn::accept(&listener).await;
    broker.complete_handshake("standalone-0-2").await;

    let resent_sequence_id = match broker.recv_command().await {
        Command::Send {
            sequence_id,
            messages,
            ..
        } => {
            assert_eq!(messages[0].value.as_ref(), b"in-flight");
            sequence_id
        }
        other => panic!("expected redriven Send, got {other:?}"),
    };
    assert_eq!(resent_sequence_id, first_sequence_id, "redrive must reuse the sequence_id");

    broker
        .send(BrokerFrame::SendReceipt {
            producer_id: 0,
            sequence_id: resent_sequence_id,
        })
        .await;

    let result = send_fut.await.unwrap();
    assert_eq!(result.unwrap(), first_sequence_id);

    handle.close().await;
}

#[tokio::test]
async fn sync_send_issued_before_the_handshake_completes_still_gets_its_receipt() {
    let (broker_url, listener) = start_fake_broker().await;
    let handle =
        PartitionProducer::spawn("persistent://p/ns/t-partition-0".into(), broker_url, Default::default())
            .unwrap();

    // Fire the sync call before accepting the socket at all — the actor is
    // still `idle`/`connecting`. The message must land in the durable queue
    // regardless (spec §1), and the reply must still arrive once the
    // handshake completes and the backlog is drained.
    let send_fut = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .send_sync(vec![Message::new(b"queued-before-connect".to_vec())], Duration::from_secs(5))
                .await
        }
    });

    let mut broker = FakeBrokerConn::accept(&listener).await;
    broker.complete_handshake("standalone-0-1").await;

    let sequence_id = match broker.recv_command().await {
        Command::Send {
            sequence_id,
            messages,
            ..
        } => {
            assert_eq!(messages[0].value.as_ref(), b"queued-before-connect");
            sequence_id
        }
        other => panic!("expected Send, got {other:?}"),
    };
    broker
        .send(BrokerFrame::SendReceipt {
            producer_id: 0,
            sequence_id,
        })
        .await;

    let result = send_fut.await.unwrap();
    assert_eq!(result.unwrap(), sequence_id);

    handle.close().await;
}

#[tokio::test(start_paused = true)]
async fn a_receipt_for_a_timed_out_caller_is_swallowed_not_errored() {
    let (broker_url, listener) = start_fake_broker().await;
    let handle =
        PartitionProducer::spawn("persistent://p/ns/t-partition-0".into(), broker_url, Default::default())
            .unwrap();

    let mut broker = FakeBrokerConn::accept(&listener).await;
    broker.complete_handshake("standalone-0-1").await;

    let send_fut = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .send_sync(vec![Message::new(b"slow".to_vec())], Duration::from_millis(100))
                .await
        }
    });

    let sequence_id = match broker.recv_command().await {
        Command::Send { sequence_id, .. } => sequence_id,
        other => panic!("expected Send, got {other:?}"),
    };

    tokio::time::advance(Duration::from_millis(200)).await;
    let result = send_fut.await.unwrap();
    assert!(matches!(result, Err(ProducerError::SendTimedOut)));

    // The broker's receipt arrives after the caller already gave up; the
    // actor must still process it without panicking.
    broker
        .send(BrokerFrame::SendReceipt {
            producer_id: 0,
            sequence_id,
        })
        .await;
    tokio::time::advance(Duration::from_millis(50)).await;

    assert_eq!(handle.connection_state(), Some(ConnectionState::Connected));
    handle.close().await;
}

#[tokio::test]
async fn broker_initiated_close_fails_a_waiting_sync_caller_with_broker_closed() {
    let (broker_url, listener) = start_fake_broker().await;
    let handle =
        PartitionProducer::spawn("persistent://p/ns/t-partition-0".into(), broker_url, Default::default())
            .unwrap();

    let mut broker = FakeBrokerConn::accept(&listener).await;
    broker.complete_handshake("standalone-0-1").await;

    let send_fut = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .send_sync(vec![Message::new(b"in-flight".to_vec())], Duration::from_secs(30))
                .await
        }
    });

    match broker.recv_command().await {
        Command::Send { .. } => {}
        other => panic!("expected Send, got {other:?}"),
    };

    broker.send(BrokerFrame::CloseProducer { producer_id: 0 }).await;

    let result = send_fut.await.unwrap();
    assert!(matches!(result, Err(ProducerError::BrokerClosed)));
}
