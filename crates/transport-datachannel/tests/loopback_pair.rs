use std::sync::Arc;

use bytes::Bytes;
use futures_util::{FutureExt, StreamExt};
use test_timeout::tokio_timeout_test;
use transport_datachannel::handle::RTC_ERR_FAILURE;
use transport_datachannel::{
    registry, DataChannelPeer, EngineCall, LoopbackEngine, Message, PeerConfig, PeerConnection,
    PeerError, PeerState, DEFAULT_LABEL,
};

fn pair(engine: &Arc<LoopbackEngine>) -> (DataChannelPeer, DataChannelPeer) {
    (
        DataChannelPeer::new(engine.clone(), PeerConfig::localhost()),
        DataChannelPeer::new(engine.clone(), PeerConfig::localhost()),
    )
}

async fn connect(offerer: &mut DataChannelPeer, answerer: &mut DataChannelPeer) {
    connect_labelled(offerer, answerer, DEFAULT_LABEL).await;
}

async fn connect_labelled(offerer: &mut DataChannelPeer, answerer: &mut DataChannelPeer, label: &str) {
    let offer = offerer.offer(label).await.expect("offer");
    let answer = answerer.accept_offer(&offer).await.expect("answer");
    offerer.accept_answer(&answer).expect("accept answer");
    offerer.await_data_channel().await.expect("offerer channel");
    answerer.await_data_channel().await.expect("answerer channel");
}

#[tokio_timeout_test(10)]
async fn chat_round_trip() {
    let engine = Arc::new(LoopbackEngine::new());
    let (mut alice, mut bob) = pair(&engine);
    connect_labelled(&mut alice, &mut bob, "chat").await;
    assert_eq!(alice.state(), PeerState::Open);
    assert_eq!(bob.state(), PeerState::Open);

    alice.send("hi").expect("send");
    assert_eq!(bob.recv().await, Some(Message::Text("hi".into())));
    assert_eq!(bob.recv().now_or_never(), None, "\"hi\" must be the only message");

    bob.send("hello back").expect("reply");
    assert_eq!(alice.recv().await, Some(Message::Text("hello back".into())));
    assert_eq!(bob.recv().now_or_never(), None, "the reply must not echo back");

    alice.close();
    assert_eq!(bob.recv().await, None, "remote close ends the stream");
    bob.close();
    assert_eq!(engine.live_handles(), 0);
}

#[tokio_timeout_test(10)]
async fn answerer_rejects_a_second_offer() {
    let engine = Arc::new(LoopbackEngine::new());
    let (mut alice, mut bob) = pair(&engine);
    let offer = alice.offer(DEFAULT_LABEL).await.expect("offer");
    bob.accept_offer(&offer).await.expect("answer");

    let err = bob.accept_offer(&offer).await.unwrap_err();
    assert!(matches!(
        err,
        PeerError::InvalidState {
            operation: "accept_offer",
            state: PeerState::AwaitingChannel
        }
    ));
    assert_eq!(engine.stats().connections_created, 2);
}

#[tokio_timeout_test(10)]
async fn answerer_shares_state_across_both_handles() {
    let engine = Arc::new(LoopbackEngine::new());
    let (mut alice, mut bob) = pair(&engine);
    connect(&mut alice, &mut bob).await;

    let (Some(pc), Some(dc)) = bob.handles() else {
        panic!("answerer must hold both handles once open");
    };
    assert_ne!(pc, dc);
    let by_connection = registry().lookup(pc).expect("connection registered");
    let by_channel = registry().lookup(dc).expect("channel registered");
    assert!(Arc::ptr_eq(&by_connection, &by_channel));
}

#[tokio_timeout_test(10)]
async fn binary_payload_keeps_length_and_bytes() {
    let engine = Arc::new(LoopbackEngine::new());
    let (mut alice, mut bob) = pair(&engine);
    connect(&mut alice, &mut bob).await;

    let payload: Vec<u8> = vec![0, 1, 0, 255, 0];
    alice.send_binary(&payload).expect("send binary");
    alice.send_binary(&[]).expect("send empty");

    assert_eq!(bob.recv().await, Some(Message::Binary(Bytes::from(payload))));
    let empty = bob.recv().await.expect("empty message delivered");
    assert!(empty.is_empty());
    assert!(empty.as_text().is_none());
}

#[tokio_timeout_test(10)]
async fn stream_drains_backlog_then_ends() {
    let engine = Arc::new(LoopbackEngine::new());
    let (mut alice, mut bob) = pair(&engine);
    connect(&mut alice, &mut bob).await;

    for i in 0..5 {
        alice.send(&format!("m{i}")).expect("send");
    }
    alice.close();

    let received: Vec<Message> = bob.incoming().collect().await;
    let expected: Vec<Message> = (0..5).map(|i| Message::Text(format!("m{i}"))).collect();
    assert_eq!(received, expected);
}

#[tokio_timeout_test(10)]
async fn send_after_close_is_rejected() {
    let engine = Arc::new(LoopbackEngine::new());
    let (mut alice, mut bob) = pair(&engine);
    connect(&mut alice, &mut bob).await;

    alice.close();
    let err = alice.send("late").unwrap_err();
    assert!(err.is_misuse());
    assert!(matches!(
        err,
        PeerError::InvalidState {
            state: PeerState::Closed,
            ..
        }
    ));
}

#[tokio_timeout_test(10)]
async fn engine_send_failure_is_reported() {
    let engine = Arc::new(LoopbackEngine::new());
    let (mut alice, mut bob) = pair(&engine);
    connect(&mut alice, &mut bob).await;

    engine.fail(EngineCall::SendMessage, RTC_ERR_FAILURE);
    let err = alice.send("dropped").unwrap_err();
    assert_eq!(
        err.to_string(),
        "rtcSendMessage failed with error code -2 (RTC_ERR_FAILURE)"
    );
    alice.send("delivered").expect("next send succeeds");
    assert_eq!(bob.recv().await, Some(Message::Text("delivered".into())));
}

#[tokio_timeout_test(10)]
async fn interior_nul_text_is_refused() {
    let engine = Arc::new(LoopbackEngine::new());
    let (mut alice, mut bob) = pair(&engine);
    connect(&mut alice, &mut bob).await;

    assert!(matches!(alice.send("a\0b"), Err(PeerError::InteriorNul)));
    assert_eq!(engine.stats().messages_sent, 0);
}

#[tokio_timeout_test(10)]
async fn dropped_peer_releases_everything() {
    let engine = Arc::new(LoopbackEngine::new());
    let (mut alice, mut bob) = pair(&engine);
    connect(&mut alice, &mut bob).await;
    let (alice_pc, alice_dc) = alice.handles();

    drop(alice);
    assert_eq!(bob.recv().await, None);
    drop(bob);

    let stats = engine.stats();
    assert_eq!(stats.connections_created, stats.connections_deleted);
    assert_eq!(stats.channels_created, stats.channels_deleted);
    for handle in [alice_pc, alice_dc].into_iter().flatten() {
        assert!(!registry().contains(handle));
    }
}

#[tokio_timeout_test(secs = 30, multi_thread)]
async fn many_pairs_in_parallel() {
    let engine = Arc::new(LoopbackEngine::new());
    let tasks: Vec<_> = (0..16)
        .map(|n| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let (mut alice, mut bob) = pair(&engine);
                connect(&mut alice, &mut bob).await;
                let text = format!("pair {n}");
                alice.send(&text).expect("send");
                assert_eq!(bob.recv().await, Some(Message::Text(text)));
                alice.close();
                bob.close();
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("pair task");
    }
    assert_eq!(engine.live_handles(), 0);
}
