// End-to-end tests against a live relay bound to an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use skiff::client::{Client, ClientOpts};
use skiff::context::Context;
use skiff::crypto;
use skiff::dispatcher::{Dispatcher, Handler, HandlerFn, HandlerFuture};
use skiff::error::Error;
use skiff::framing;
use skiff::mailbox::Mailbox;
use skiff::message::{Hello, Message, Pake, Role};
use skiff::relay::{RelayConfig, RelayServer};
use skiff::{DEFAULT_APP_ID, DEFAULT_RELAY_PASSWORD, KEY_SIZE};

async fn start_relay() -> (SocketAddr, Arc<Mailbox>, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let server = RelayServer::new(RelayConfig {
        address: addr.to_string(),
        ..Default::default()
    });
    let mailbox = server.mailbox();
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(listener, cancel.clone()));

    (addr, mailbox, cancel)
}

fn opts_for(addr: SocketAddr) -> ClientOpts {
    ClientOpts {
        relay_address: addr.to_string(),
        ..Default::default()
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn joined_client(addr: SocketAddr, key: &str, role: Role) -> Client {
    let mut client = Client::connect(opts_for(addr)).await.expect("connect");
    client.exchange_pake().await.expect("pake");
    client.join(key, role).await.expect("join");
    client
}

#[tokio::test]
async fn happy_pake_over_a_raw_socket() {
    let (addr, mailbox, cancel) = start_relay().await;

    let mut conn = TcpStream::connect(addr).await.expect("connect");

    let (spake, outbound) = crypto::start_pake(DEFAULT_RELAY_PASSWORD, DEFAULT_APP_ID);
    let msg = Message::with_value("pake", &Pake { body: outbound }).expect("build pake");
    framing::write_frame(&mut conn, &msg.encode().expect("encode"))
        .await
        .expect("write pake");

    let reply = Message::decode(&framing::read_frame(&mut conn).await.expect("read reply"))
        .expect("decode reply");
    assert_eq!(reply.action, "pake");
    assert!(reply.error.is_empty());

    let pake_reply: Pake = reply.bind().expect("bind pake");
    let key = crypto::finish_pake(spake, &pake_reply.body).expect("finish");
    assert_eq!(key.len(), KEY_SIZE);

    // The relay accepts an encrypted hello only if it derived the same key.
    let hello = Message::with_value(
        "hello",
        &Hello {
            relay_key: "happy".to_string(),
            connection_type: Role::Sender,
        },
    )
    .expect("build hello");
    framing::write_encrypted_frame(&mut conn, &hello.encode().expect("encode"), &key)
        .await
        .expect("write hello");

    wait_until("slot registration", || {
        mailbox.occupancy("happy") == Some((true, false))
    })
    .await;

    cancel.cancel();
}

#[tokio::test]
async fn bad_password_closes_the_connection() {
    let (addr, mailbox, cancel) = start_relay().await;

    let mut opts = opts_for(addr);
    opts.relay_password = "wrong".to_string();

    // Symmetric SPAKE2 cannot spot the mismatch during the exchange; the
    // derived keys simply differ.
    let mut client = Client::connect(opts).await.expect("connect");
    client.exchange_pake().await.expect("pake exchange completes");

    // The first encrypted frame fails to open on the relay, which closes the
    // connection; we observe a transport error on the next read.
    client.join("room", Role::Sender).await.expect("join write");
    let err = client.recv_frame().await.expect_err("read should fail");
    assert!(matches!(err, Error::ConnectionClosed | Error::Io(_)));

    assert!(mailbox.is_empty(), "no slot should have been registered");
    cancel.cancel();
}

#[tokio::test]
async fn pairing_fills_both_slots_and_forwards_opaquely() {
    let (addr, mailbox, cancel) = start_relay().await;

    let mut sender = joined_client(addr, "room-7", Role::Sender).await;
    let mut receiver = joined_client(addr, "room-7", Role::Receiver).await;

    wait_until("both slots", || {
        mailbox.occupancy("room-7") == Some((true, true))
    })
    .await;
    assert_eq!(mailbox.len(), 1);

    // Frames pass through the relay untouched, in both directions.
    sender
        .send_frame(b"chunk from the sender")
        .await
        .expect("sender write");
    let forwarded = receiver.recv_frame().await.expect("receiver read");
    assert_eq!(forwarded, b"chunk from the sender");

    receiver.send_frame(b"ack").await.expect("receiver write");
    let forwarded = sender.recv_frame().await.expect("sender read");
    assert_eq!(forwarded, b"ack");

    cancel.cancel();
}

#[tokio::test]
async fn third_sender_is_rejected_and_relay_untouched() {
    let (addr, mailbox, cancel) = start_relay().await;

    let _sender = joined_client(addr, "room-7", Role::Sender).await;
    let _receiver = joined_client(addr, "room-7", Role::Receiver).await;
    wait_until("both slots", || {
        mailbox.occupancy("room-7") == Some((true, true))
    })
    .await;

    let mut third = joined_client(addr, "room-7", Role::Sender).await;
    let reply = third.recv_message().await.expect("error envelope");
    assert_eq!(reply.error, "already have a sender");

    assert_eq!(mailbox.occupancy("room-7"), Some((true, true)));
    assert_eq!(mailbox.len(), 1);

    cancel.cancel();
}

#[tokio::test]
async fn rejected_hello_may_retry_a_different_slot() {
    let (addr, mailbox, cancel) = start_relay().await;

    let _sender = joined_client(addr, "room-7", Role::Sender).await;

    let mut late = joined_client(addr, "room-7", Role::Sender).await;
    let reply = late.recv_message().await.expect("error envelope");
    assert_eq!(reply.error, "already have a sender");

    // The connection is still authenticated and may announce another slot.
    late.join("room-8", Role::Sender).await.expect("second join");
    wait_until("second slot", || {
        mailbox.occupancy("room-8") == Some((true, false))
    })
    .await;

    cancel.cancel();
}

#[tokio::test]
async fn large_encrypted_frame_survives_fragmentation() {
    // A 65 537-byte payload reassembled from however the transport slices it.
    let key = [42u8; KEY_SIZE];
    let payload: Vec<u8> = (0..65_537u32).map(|i| (i % 251) as u8).collect();

    // A tiny duplex buffer forces the frame through many partial reads.
    let (mut a, mut b) = tokio::io::duplex(13);

    let to_send = payload.clone();
    let writer = tokio::spawn(async move {
        framing::write_encrypted_frame(&mut a, &to_send, &key)
            .await
            .expect("write");
    });

    let read = framing::read_encrypted_frame(&mut b, &key)
        .await
        .expect("read");
    assert_eq!(read, payload);
    writer.await.expect("writer task");
}

#[tokio::test]
async fn shutdown_closes_listener_and_connections() {
    let (addr, _mailbox, cancel) = start_relay().await;

    let mut client = Client::connect(opts_for(addr)).await.expect("connect");
    client.exchange_pake().await.expect("pake");

    cancel.cancel();

    // The connection task observes the signal and closes its socket.
    let read = tokio::time::timeout(Duration::from_secs(5), client.recv_frame())
        .await
        .expect("read should settle within five seconds");
    assert!(read.is_err());

    // The listener goes away with the accept loop.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match TcpStream::connect(addr).await {
                Err(_) => break,
                Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .expect("listener should close within five seconds");
}

#[tokio::test]
async fn forwarding_keeps_framing_intact_for_many_frames() {
    let (addr, mailbox, cancel) = start_relay().await;

    let mut sender = joined_client(addr, "burst", Role::Sender).await;
    let mut receiver = joined_client(addr, "burst", Role::Receiver).await;
    wait_until("both slots", || {
        mailbox.occupancy("burst") == Some((true, true))
    })
    .await;

    let frames: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i; (i as usize % 7) + 1]).collect();
    for frame in &frames {
        sender.send_frame(frame).await.expect("send");
    }
    for frame in &frames {
        let got = receiver.recv_frame().await.expect("recv");
        assert_eq!(&got, frame);
    }

    cancel.cancel();
}

#[tokio::test]
async fn send_and_receive_commands_transfer_a_file() {
    let (addr, _mailbox, cancel) = start_relay().await;

    // Big enough to span several transfer chunks.
    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let input_name = format!("skiff_e2e_{}.bin", std::process::id());
    let input_path = std::env::temp_dir().join(&input_name);
    std::fs::write(&input_path, &payload).expect("write input file");

    let code = 654_321u32;
    let input = input_path.to_string_lossy().into_owned();
    let send_opts = opts_for(addr);
    let receive_opts = opts_for(addr);

    let (send_result, receive_result) =
        tokio::time::timeout(Duration::from_secs(30), async {
            tokio::join!(
                skiff::commands::send::run(&input, send_opts, Some(code)),
                skiff::commands::receive::run(receive_opts, Some(code)),
            )
        })
        .await
        .expect("transfer should finish within thirty seconds");

    send_result.expect("send should succeed");
    receive_result.expect("receive should succeed");

    // The receive command writes new_<name> into the working directory.
    let output_path = format!("new_{}", input_name);
    let received = std::fs::read(&output_path).expect("output file should exist");
    assert_eq!(received, payload);

    let _ = std::fs::remove_file(&input_path);
    let _ = std::fs::remove_file(&output_path);
    cancel.cancel();
}

#[tokio::test]
async fn dial_runs_start_action_and_read_loop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    fn pong_on_ping<'a>(ctx: &'a mut Context) -> HandlerFuture<'a> {
        Box::pin(async move {
            let msg = Message::new("pong", Vec::new());
            ctx.write_msg(&msg).await
        })
    }

    let mut server = Dispatcher::new(addr.to_string());
    server.action("ping", pong_on_ping as HandlerFn);
    let server_cancel = CancellationToken::new();
    tokio::spawn(server.serve(listener, server_cancel.clone()));

    let done = CancellationToken::new();

    struct SendPing;
    impl Handler for SendPing {
        fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerFuture<'a> {
            Box::pin(async move {
                let msg = Message::new("ping", Vec::new());
                ctx.write_msg(&msg).await
            })
        }
    }

    struct StopOnPong {
        done: CancellationToken,
    }
    impl Handler for StopOnPong {
        fn call<'a>(&'a self, _ctx: &'a mut Context) -> HandlerFuture<'a> {
            let done = self.done.clone();
            Box::pin(async move {
                done.cancel();
                Ok(())
            })
        }
    }

    let mut client = Dispatcher::new(String::new());
    client.action("start", SendPing);
    client.action("pong", StopOnPong { done: done.clone() });

    let dial_cancel = done.clone();
    let dialed =
        tokio::spawn(async move { client.dial(&addr.to_string(), "start", dial_cancel).await });

    tokio::time::timeout(Duration::from_secs(5), done.cancelled())
        .await
        .expect("pong should arrive");
    dialed.await.expect("dial task").expect("dial should succeed");

    server_cancel.cancel();
}

#[tokio::test]
async fn peer_disconnect_tears_the_relay_down() {
    let (addr, mailbox, cancel) = start_relay().await;

    let sender = joined_client(addr, "gone", Role::Sender).await;
    let mut receiver = joined_client(addr, "gone", Role::Receiver).await;
    wait_until("both slots", || {
        mailbox.occupancy("gone") == Some((true, true))
    })
    .await;

    drop(sender);

    // The forwarder's read fails, both directions stop, and the entry goes.
    let read = tokio::time::timeout(Duration::from_secs(5), receiver.recv_frame())
        .await
        .expect("read should settle");
    assert!(read.is_err());
    wait_until("entry removal", || mailbox.is_empty()).await;

    cancel.cancel();
}
