#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge cases across layers: re-entrant dispatch, oversize sends, unknown
//! types on a live channel, version skew and cryptor boundaries.

mod common;

use common::{eventually, registry, server_config, start_server, transport, Blob, Chat};
use secure_channel::config::TransportConfig;
use secure_channel::service::event_stream;
use secure_channel::utils::crypto::{Cryptor, CryptorKind, CryptorSlot, NullCryptor, RsaCryptor};
use secure_channel::{
    Channel, ChannelEvent, ChannelState, Client, Dispatcher, Handler, Message, MessageRegistry,
    OwnerId, ProtocolError,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Unlisted {
    note: String,
}
impl Message for Unlisted {}

fn rsa_1024() -> &'static RsaCryptor {
    static KEY: OnceLock<RsaCryptor> = OnceLock::new();
    KEY.get_or_init(|| RsaCryptor::generate(1024).expect("keygen"))
}

// ============================================================================
// DISPATCHER RE-ENTRANCY
// ============================================================================

#[test]
fn test_handler_removing_itself_mid_dispatch() {
    let dispatcher: Arc<Dispatcher<()>> = Arc::new(Dispatcher::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<Handler<(), Chat>>>> = Arc::default();

    let handler = {
        let dispatcher = Arc::downgrade(&dispatcher);
        let calls = Arc::clone(&calls);
        let slot = Arc::clone(&slot);
        Handler::new(move |_: &(), _: &Chat| {
            calls.fetch_add(1, Ordering::SeqCst);
            if let (Some(dispatcher), Some(me)) = (dispatcher.upgrade(), slot.lock().unwrap().clone())
            {
                assert!(dispatcher.remove(OwnerId::STATIC, &me));
            }
            Ok(())
        })
    };
    *slot.lock().unwrap() = Some(handler.clone());
    dispatcher.add(OwnerId::STATIC, &handler).unwrap();

    let chat = Chat {
        from: 0,
        seq: 0,
        text: String::new(),
    };
    assert_eq!(dispatcher.dispatch_message(&(), &chat), 1);
    assert_eq!(dispatcher.dispatch_message(&(), &chat), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_handler_added_mid_dispatch_runs_next_time() {
    let dispatcher: Arc<Dispatcher<()>> = Arc::new(Dispatcher::new());
    let late_calls = Arc::new(AtomicUsize::new(0));

    let late = {
        let late_calls = Arc::clone(&late_calls);
        Handler::new(move |_: &(), _: &Chat| {
            late_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };
    let adder = {
        let dispatcher = Arc::downgrade(&dispatcher);
        let late = late.clone();
        Handler::new(move |_: &(), _: &Chat| {
            if let Some(dispatcher) = dispatcher.upgrade() {
                // Second and later adds are duplicates; only the first succeeds.
                let _ = dispatcher.add(OwnerId::STATIC, &late);
            }
            Ok(())
        })
    };
    dispatcher.add(OwnerId::STATIC, &adder).unwrap();

    let chat = Chat {
        from: 0,
        seq: 0,
        text: String::new(),
    };
    assert_eq!(dispatcher.dispatch_message(&(), &chat), 1);
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.dispatch_message(&(), &chat), 2);
    assert_eq!(late_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_handler_does_not_stop_others() {
    let dispatcher: Dispatcher<()> = Dispatcher::new();
    let after = Arc::new(AtomicUsize::new(0));
    dispatcher
        .add(
            OwnerId::STATIC,
            &Handler::new(|_: &(), _: &Chat| panic!("handler bug")),
        )
        .unwrap();
    {
        let after = Arc::clone(&after);
        dispatcher
            .add(
                OwnerId::STATIC,
                &Handler::new(move |_: &(), _: &Chat| {
                    after.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
    }

    let envelope = secure_channel::Envelope::new(Chat {
        from: 0,
        seq: 0,
        text: String::new(),
    });
    let report = dispatcher.dispatch_report(&(), &envelope);
    assert_eq!(report.invoked, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

// ============================================================================
// CRYPTOR BOUNDARIES
// ============================================================================

#[test]
fn test_rsa_empty_and_chunk_boundary_plaintexts() {
    let rsa = rsa_1024();
    let chunk = rsa.max_chunk();
    let block = rsa.block_size();

    for len in [0, 1, chunk - 1, chunk, chunk + 1, 3 * chunk] {
        let plain = vec![0x5Au8; len];
        let sealed = rsa.encode(&plain).unwrap();
        assert_eq!(sealed.len() % block, 0);
        assert_eq!(sealed.len() / block, len.div_ceil(chunk).max(1));
        assert_eq!(rsa.decode(&sealed).unwrap(), plain);
    }
}

#[test]
fn test_rsa_ciphertext_not_block_aligned_fails() {
    let rsa = rsa_1024();
    let mut sealed = rsa.encode(b"aligned").unwrap();
    sealed.pop();
    assert!(matches!(
        rsa.decode(&sealed),
        Err(ProtocolError::DecryptionFailure)
    ));
}

#[test]
fn test_slot_refuses_to_fall_back_to_plaintext() {
    let slot = CryptorSlot::new();
    let public = RsaCryptor::from_public_key_base64(&rsa_1024().public_key_base64().unwrap())
        .unwrap();
    slot.advance(Arc::new(public)).unwrap();
    assert_eq!(slot.kind(), CryptorKind::Asymmetric);

    let err = slot.advance(Arc::new(NullCryptor)).unwrap_err();
    assert!(matches!(err, ProtocolError::CryptorRegression { .. }));
    assert_eq!(slot.kind(), CryptorKind::Asymmetric);
}

// ============================================================================
// LIVE CHANNEL EDGES
// ============================================================================

#[tokio::test]
async fn test_oversized_send_fails_without_closing() {
    let received = Arc::new(AtomicUsize::new(0));
    let dispatcher = Arc::new(Dispatcher::new());
    {
        let received = Arc::clone(&received);
        dispatcher
            .add(
                OwnerId::STATIC,
                &Handler::new(move |_: &Channel, _: &Blob| {
                    received.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
    }
    let harness = start_server(server_config(), &transport(), dispatcher, registry()).await;
    let client = common::client(Arc::new(Dispatcher::new()), registry());
    let channel = client
        .connect("127.0.0.1", harness.port(), CancellationToken::new())
        .await
        .unwrap();

    let too_big = Blob {
        data: vec![1; 32 * 1024],
    };
    assert!(matches!(
        channel.send(&too_big).await,
        Err(ProtocolError::OversizedPacket(_))
    ));
    assert!(channel.is_ready());

    channel.send(&Blob { data: vec![2; 64] }).await.unwrap();
    assert!(eventually(Duration::from_secs(5), || received.load(Ordering::SeqCst) == 1).await);

    client.close();
    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_type_on_live_channel_closes_it() {
    let harness = start_server(
        server_config(),
        &transport(),
        Arc::new(Dispatcher::new()),
        registry(),
    )
    .await;
    let (observer, mut events) = event_stream();
    harness.server.subscribe(observer);

    // The client knows a type the server never registered.
    let wider = Arc::new(
        MessageRegistry::builder()
            .register::<Chat>()
            .unwrap()
            .register::<Blob>()
            .unwrap()
            .register::<Unlisted>()
            .unwrap()
            .build(),
    );
    let client = common::client(Arc::new(Dispatcher::new()), wider);
    let channel = client
        .connect("127.0.0.1", harness.port(), CancellationToken::new())
        .await
        .unwrap();
    channel
        .send(&Unlisted {
            note: "surprise".into(),
        })
        .await
        .unwrap();

    let cause = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ChannelEvent::Closed(_, cause) => break cause,
            ChannelEvent::Handshaked(_) | ChannelEvent::MessageReceived(..) => {}
        }
    };
    match cause {
        ProtocolError::UnknownMessageType(id) => assert_eq!(id, Unlisted::wire_id()),
        other => panic!("unexpected cause: {other}"),
    }
    harness.stop().await;
}

#[tokio::test]
async fn test_handler_can_close_its_channel() {
    let dispatcher = Arc::new(Dispatcher::new());
    let handled = Arc::new(AtomicUsize::new(0));
    {
        let handled = Arc::clone(&handled);
        dispatcher
            .add(
                OwnerId::STATIC,
                &Handler::new(move |channel: &Channel, chat: &Chat| {
                    handled.fetch_add(1, Ordering::SeqCst);
                    if chat.text == "bye" {
                        channel.close();
                    }
                    Ok(())
                }),
            )
            .unwrap();
    }
    let harness = start_server(server_config(), &transport(), dispatcher, registry()).await;
    let client = common::client(Arc::new(Dispatcher::new()), registry());
    let channel = client
        .connect("127.0.0.1", harness.port(), CancellationToken::new())
        .await
        .unwrap();

    channel
        .send(&Chat {
            from: 0,
            seq: 0,
            text: "bye".into(),
        })
        .await
        .unwrap();

    let cause = tokio::time::timeout(Duration::from_secs(5), channel.closed())
        .await
        .unwrap();
    assert!(cause.is_graceful_close());
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    harness.stop().await;
}

#[tokio::test]
async fn test_major_version_skew_fails_client_handshake() {
    let server_transport = TransportConfig {
        protocol_version: "2.1.0".into(),
        ..transport()
    };
    let harness = start_server(
        server_config(),
        &server_transport,
        Arc::new(Dispatcher::new()),
        registry(),
    )
    .await;

    let client = common::client(Arc::new(Dispatcher::new()), registry());
    let err = client
        .connect("127.0.0.1", harness.port(), CancellationToken::new())
        .await
        .expect_err("handshake across major versions");
    assert!(matches!(err, ProtocolError::UnsupportedVersion(v) if v == "2.1.0"));
    assert!(!client.is_connected());
    harness.stop().await;
}

#[tokio::test]
async fn test_minor_version_skew_is_accepted() {
    let server_transport = TransportConfig {
        protocol_version: "1.4.2".into(),
        ..transport()
    };
    let harness = start_server(
        server_config(),
        &server_transport,
        Arc::new(Dispatcher::new()),
        registry(),
    )
    .await;

    let client = Client::new(
        &common::client_config(),
        &transport(),
        Arc::new(Dispatcher::new()),
        registry(),
    );
    let channel = client
        .connect("127.0.0.1", harness.port(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(channel.cryptor_kind(), CryptorKind::Symmetric);

    client.close();
    harness.stop().await;
}

#[tokio::test]
async fn test_unhandled_message_still_reaches_observers() {
    let harness = start_server(
        server_config(),
        &transport(),
        Arc::new(Dispatcher::new()),
        registry(),
    )
    .await;
    let (observer, mut events) = event_stream();
    harness.server.subscribe(observer);

    let client = common::client(Arc::new(Dispatcher::new()), registry());
    client
        .connect("127.0.0.1", harness.port(), CancellationToken::new())
        .await
        .unwrap();
    client
        .send(&Chat {
            from: 9,
            seq: 1,
            text: "anyone?".into(),
        })
        .await
        .unwrap();

    let envelope = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ChannelEvent::MessageReceived(_, envelope) => break envelope,
            ChannelEvent::Handshaked(_) => {}
            ChannelEvent::Closed(_, cause) => panic!("closed: {cause}"),
        }
    };
    assert_eq!(envelope.downcast_ref::<Chat>().unwrap().from, 9);

    client.close();
    harness.stop().await;
}

// ============================================================================
// ADOPTED SOCKETS
// ============================================================================

#[tokio::test]
async fn test_client_from_connected_stream() {
    let got = Arc::new(AtomicUsize::new(0));
    let dispatcher = Arc::new(Dispatcher::new());
    let sink = Arc::clone(&got);
    dispatcher
        .add(
            OwnerId::STATIC,
            &Handler::new(move |_: &Channel, _: &Chat| {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
    let harness = start_server(server_config(), &transport(), dispatcher, registry()).await;

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", harness.port()))
        .await
        .unwrap();
    let client = Client::from_stream(
        stream,
        &common::client_config(),
        &transport(),
        Arc::new(Dispatcher::new()),
        registry(),
        CancellationToken::new(),
    )
    .await
    .expect("handshake over adopted socket");
    assert!(client.is_connected());

    client
        .send(&Chat {
            from: 1,
            seq: 0,
            text: "adopted".into(),
        })
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(5), || got.load(Ordering::SeqCst) == 1).await);

    // A live adopted channel blocks a second one.
    let extra = tokio::net::TcpStream::connect(("127.0.0.1", harness.port()))
        .await
        .unwrap();
    assert!(matches!(
        client.adopt(extra, CancellationToken::new()).await,
        Err(ProtocolError::AlreadyConnected)
    ));

    client.close();
    harness.stop().await;
}
