use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use rkv_client::{
    ClientConfig, ClientError, ClientResult, KVClient, Message, MessageStream, PubSubConfig,
};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy)]
struct Behavior {
    answer_ping: bool,
    reject_subscribe: bool,
    /// Never confirm SUBSCRIBE.
    silent_subscribe: bool,
    /// Publish on the first channel between subscribe confirmations.
    publish_during_handshake: bool,
    /// Put three publishes on the wire ahead of every pong.
    chatter_before_pong: bool,
    /// Stop reading from the client after its first command.
    stall_reads: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior {
            answer_ping: true,
            reject_subscribe: false,
            silent_subscribe: false,
            publish_during_handshake: false,
            chatter_before_pong: false,
            stall_reads: false,
        }
    }
}

enum Control {
    Publish { channel: String, payload: Vec<u8> },
    PushError(String),
    Disconnect,
}

/// Single-connection pub/sub server that records every command it reads.
struct FakeServer {
    addr: SocketAddr,
    control: mpsc::UnboundedSender<Control>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
}

impl FakeServer {
    async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (control, control_rx) = mpsc::unbounded_channel();
        let commands = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve(listener, behavior, control_rx, commands.clone()));
        FakeServer {
            addr,
            control,
            commands,
        }
    }

    fn publish(&self, channel: &str, payload: &[u8]) {
        let _ = self.control.send(Control::Publish {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        });
    }

    fn push_error(&self, message: &str) {
        let _ = self.control.send(Control::PushError(message.to_string()));
    }

    fn disconnect(&self) {
        let _ = self.control.send(Control::Disconnect);
    }

    fn count(&self, name: &str) -> usize {
        self.commands
            .lock()
            .expect("commands")
            .iter()
            .filter(|args| args[0].eq_ignore_ascii_case(name))
            .count()
    }

    fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().expect("commands").clone()
    }

    async fn wait_for_command(&self, name: &str) {
        timeout(WAIT, async {
            while self.count(name) == 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("server never saw {}", name));
    }
}

async fn serve(
    listener: TcpListener,
    behavior: Behavior,
    mut control: mpsc::UnboundedReceiver<Control>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
) {
    let (stream, _) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(_) => return,
    };
    let (read, mut write) = stream.into_split();

    // Commands are parsed on their own task so the select below stays
    // cancel-safe.
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = BufReader::new(read);
        while let Ok(Some(args)) = read_command(&mut reader).await {
            if cmd_tx.send(args).is_err() {
                break;
            }
            if behavior.stall_reads {
                // Keep the socket open but let the client's writes pile up.
                std::future::pending::<()>().await;
            }
        }
    });

    let mut subscribed: Vec<String> = Vec::new();
    loop {
        let mut out = Vec::new();
        tokio::select! {
            args = cmd_rx.recv() => {
                let args = match args {
                    Some(args) => args,
                    None => return,
                };
                commands.lock().expect("commands").push(args.clone());
                reply(&args, behavior, &mut subscribed, &mut out);
            }
            ctl = control.recv() => match ctl {
                Some(Control::Publish { channel, payload }) => {
                    if subscribed.contains(&channel) {
                        message_frame(&mut out, &channel, &payload);
                    }
                }
                Some(Control::PushError(message)) => {
                    out.extend_from_slice(format!("-{}\r\n", message).as_bytes());
                }
                Some(Control::Disconnect) | None => return,
            },
        }
        if !out.is_empty() && write.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn reply(args: &[String], behavior: Behavior, subscribed: &mut Vec<String>, out: &mut Vec<u8>) {
    match args[0].to_ascii_uppercase().as_str() {
        "SUBSCRIBE" if behavior.reject_subscribe => {
            out.extend_from_slice(b"-ERR subscriptions disabled\r\n");
        }
        "SUBSCRIBE" if behavior.silent_subscribe => {}
        "SUBSCRIBE" => {
            for (idx, channel) in args[1..].iter().enumerate() {
                if !subscribed.contains(channel) {
                    subscribed.push(channel.clone());
                }
                count_frame(out, b"subscribe", Some(channel), subscribed.len());
                if behavior.publish_during_handshake && idx == 0 {
                    message_frame(out, channel, b"early-1");
                    message_frame(out, channel, b"early-2");
                }
            }
        }
        "UNSUBSCRIBE" => {
            let targets = if args.len() == 1 {
                subscribed.clone()
            } else {
                args[1..].to_vec()
            };
            if targets.is_empty() {
                count_frame(out, b"unsubscribe", None, 0);
            }
            for channel in targets {
                subscribed.retain(|name| name != &channel);
                count_frame(out, b"unsubscribe", Some(&channel), subscribed.len());
            }
        }
        "PING" if behavior.answer_ping => {
            if let Some(channel) = subscribed.first().filter(|_| behavior.chatter_before_pong) {
                for payload in [b"a", b"b", b"c"] {
                    message_frame(out, channel, payload);
                }
            }
            out.extend_from_slice(b"*2\r\n");
            bulk(out, b"pong");
            bulk(out, b"");
        }
        "PING" => {}
        _ => out.extend_from_slice(b"-ERR unknown command\r\n"),
    }
}

fn count_frame(out: &mut Vec<u8>, kind: &[u8], channel: Option<&String>, count: usize) {
    out.extend_from_slice(b"*3\r\n");
    bulk(out, kind);
    match channel {
        Some(channel) => bulk(out, channel.as_bytes()),
        None => out.extend_from_slice(b"$-1\r\n"),
    }
    out.extend_from_slice(format!(":{}\r\n", count).as_bytes());
}

fn message_frame(out: &mut Vec<u8>, channel: &str, payload: &[u8]) {
    out.extend_from_slice(b"*3\r\n");
    bulk(out, b"message");
    bulk(out, channel.as_bytes());
    bulk(out, payload);
}

fn bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

async fn read_command(
    reader: &mut BufReader<OwnedReadHalf>,
) -> std::io::Result<Option<Vec<String>>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let count: usize = line
        .trim_end()
        .strip_prefix('*')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"))?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await?;
        let len: usize = line
            .trim_end()
            .strip_prefix('$')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"))?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await?;
        data.truncate(len);
        args.push(String::from_utf8_lossy(&data).into_owned());
    }
    Ok(Some(args))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client_for(server: &FakeServer, pubsub: PubSubConfig) -> KVClient {
    init_tracing();
    KVClient::with_config(ClientConfig {
        host: server.addr.ip().to_string(),
        port: server.addr.port(),
        max_total: 1,
        test_on_borrow: false,
        read_timeout: Some(Duration::from_secs(1)),
        write_timeout: Some(Duration::from_secs(1)),
        connect_timeout: Some(Duration::from_secs(1)),
        pubsub,
        ..ClientConfig::default()
    })
}

fn quiet() -> PubSubConfig {
    PubSubConfig {
        keepalive_interval: Duration::ZERO,
        probe_timeout: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(1),
        write_timeout: Duration::from_secs(1),
        message_buffer: 1,
    }
}

async fn next(stream: &mut MessageStream) -> Option<ClientResult<Message>> {
    timeout(WAIT, stream.recv()).await.expect("stream stalled")
}

async fn next_message(stream: &mut MessageStream) -> Message {
    match next(stream).await {
        Some(Ok(message)) => message,
        other => panic!("expected message, got {:?}", other),
    }
}

#[tokio::test]
async fn subscribe_delivers_then_close_ends_stream() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());

    let (mut stream, handle) = client.subscribe(&["orders"]).await.expect("subscribe");
    assert_eq!(handle.active_channels(), 1);
    assert_eq!(client.pool_stats().total, 1);

    server.publish("orders", b"42");
    let message = next_message(&mut stream).await;
    assert_eq!(message.channel, "orders");
    assert_eq!(&message.payload[..], b"42");

    handle.close().await.expect("close");
    assert!(next(&mut stream).await.is_none());
    assert!(handle.is_closed());
    assert_eq!(client.pool_stats().total, 0);
    server.wait_for_command("UNSUBSCRIBE").await;

    assert!(matches!(handle.close().await, Err(ClientError::NotConnected)));
}

#[tokio::test]
async fn subscribe_collapses_duplicate_channels() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());

    let (_stream, handle) = client.subscribe(&["a", "a", "b"]).await.expect("subscribe");
    assert_eq!(handle.active_channels(), 2);
    assert_eq!(server.commands()[0], vec!["SUBSCRIBE", "a", "b"]);
}

#[tokio::test]
async fn messages_keep_publish_order() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());
    let (mut stream, _handle) = client.subscribe(&["a", "b"]).await.expect("subscribe");

    server.publish("a", b"1");
    server.publish("b", b"x");
    server.publish("a", b"2");
    server.publish("a", b"3");

    let received: Vec<(String, Vec<u8>)> = {
        let mut out = Vec::new();
        for _ in 0..4 {
            let message = next_message(&mut stream).await;
            out.push((message.channel, message.payload.to_vec()));
        }
        out
    };
    let on_a: Vec<&[u8]> = received
        .iter()
        .filter(|(channel, _)| channel == "a")
        .map(|(_, payload)| payload.as_slice())
        .collect();
    let expected: Vec<&[u8]> = vec![b"1", b"2", b"3"];
    assert_eq!(on_a, expected);
    assert_eq!(received[1], ("b".to_string(), b"x".to_vec()));
}

#[tokio::test]
async fn slow_consumer_loses_nothing() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());
    let (mut stream, _handle) = client.subscribe(&["jobs"]).await.expect("subscribe");

    for i in 0..5 {
        server.publish("jobs", format!("job-{}", i).as_bytes());
    }
    // The buffer holds one item; the rest wait on the receiver and the socket.
    sleep(Duration::from_millis(200)).await;

    for i in 0..5 {
        let message = next_message(&mut stream).await;
        assert_eq!(message.payload, format!("job-{}", i).into_bytes());
    }
}

#[tokio::test]
async fn concurrent_close_succeeds_once() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());
    let (mut stream, handle) = client.subscribe(&["orders"]).await.expect("subscribe");

    let (first, second) = tokio::join!(handle.close(), handle.close());
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Err(ClientError::NotConnected)))
            .count(),
        1
    );
    assert!(next(&mut stream).await.is_none());
}

#[tokio::test]
async fn unsubscribing_everything_ends_stream_quietly() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());
    let (mut stream, handle) = client.subscribe(&["a", "b"]).await.expect("subscribe");

    handle.unsubscribe(&[]).await.expect("unsubscribe");
    assert!(next(&mut stream).await.is_none());
    assert_eq!(handle.active_channels(), 0);
    assert_eq!(client.pool_stats().total, 0);
    assert!(matches!(handle.close().await, Err(ClientError::NotConnected)));
}

#[tokio::test]
async fn partial_unsubscribe_keeps_other_channels() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());
    let (mut stream, handle) = client.subscribe(&["a", "b"]).await.expect("subscribe");

    handle.unsubscribe(&["a"]).await.expect("unsubscribe");
    server.wait_for_command("UNSUBSCRIBE").await;
    server.publish("b", b"still here");

    let message = next_message(&mut stream).await;
    assert_eq!(message.channel, "b");
    assert_eq!(handle.active_channels(), 1);
    assert!(!handle.is_closed());
}

#[tokio::test]
async fn handle_subscribes_to_more_channels() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());
    let (mut stream, handle) = client.subscribe(&["a"]).await.expect("subscribe");

    handle.subscribe(&["b"]).await.expect("subscribe more");
    timeout(WAIT, async {
        while server.count("SUBSCRIBE") < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second subscribe");
    server.publish("b", b"late");

    let message = next_message(&mut stream).await;
    assert_eq!(message.channel, "b");
    assert_eq!(handle.active_channels(), 2);
}

#[tokio::test]
async fn rejected_subscribe_fails_and_releases_connection() {
    let server = FakeServer::start(Behavior {
        reject_subscribe: true,
        ..Behavior::default()
    })
    .await;
    let client = client_for(&server, quiet());

    match client.subscribe(&["orders"]).await {
        Err(ClientError::SubscribeFailed(cause)) => {
            assert!(matches!(*cause, ClientError::Server { .. }))
        }
        Err(other) => panic!("expected subscribe failure, got {:?}", other),
        Ok(_) => panic!("subscribe unexpectedly succeeded"),
    }
    assert_eq!(client.pool_stats().total, 0);
}

#[tokio::test]
async fn subscription_holds_a_pool_slot() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());
    let (_stream, handle) = client.subscribe(&["orders"]).await.expect("subscribe");

    assert!(matches!(client.get(b"key").await, Err(ClientError::PoolExhausted)));
    handle.close().await.expect("close");
    assert_eq!(client.pool_stats().total, 0);
}

#[tokio::test]
async fn server_disconnect_reports_connection_lost() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());
    let (mut stream, handle) = client.subscribe(&["orders"]).await.expect("subscribe");

    server.disconnect();
    match next(&mut stream).await {
        Some(Err(err)) => {
            assert!(matches!(err, ClientError::ConnectionLost(_)));
            assert!(err.is_terminal());
        }
        other => panic!("expected connection lost, got {:?}", other),
    }
    assert!(next(&mut stream).await.is_none());
    assert!(matches!(handle.close().await, Err(ClientError::NotConnected)));
}

#[tokio::test]
async fn pushed_error_reports_connection_lost() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());
    let (mut stream, _handle) = client.subscribe(&["orders"]).await.expect("subscribe");

    server.push_error("ERR boom");
    match next(&mut stream).await {
        Some(Err(ClientError::ConnectionLost(cause))) => {
            assert!(matches!(*cause, ClientError::Server { .. }))
        }
        other => panic!("expected connection lost, got {:?}", other),
    }
    assert!(next(&mut stream).await.is_none());
}

#[tokio::test]
async fn unanswered_keepalive_fails_exactly_once() {
    let server = FakeServer::start(Behavior {
        answer_ping: false,
        ..Behavior::default()
    })
    .await;
    let client = client_for(
        &server,
        PubSubConfig {
            keepalive_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(50),
            ..quiet()
        },
    );
    let (mut stream, handle) = client.subscribe(&["orders"]).await.expect("subscribe");

    // Long enough for several probe intervals to pass.
    sleep(Duration::from_millis(400)).await;

    let mut errors = Vec::new();
    while let Some(item) = next(&mut stream).await {
        match item {
            Err(err) => errors.push(err),
            Ok(message) => panic!("unexpected message {:?}", message),
        }
    }
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ClientError::LivenessCheckFailed(_)));
    assert!(handle.is_closed());
    assert!(matches!(handle.unsubscribe(&["orders"]).await, Err(ClientError::NotConnected)));
    assert_eq!(server.count("PING"), 1);
}

#[tokio::test]
async fn answered_keepalive_keeps_subscription_alive() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(
        &server,
        PubSubConfig {
            keepalive_interval: Duration::from_millis(30),
            probe_timeout: Duration::from_millis(500),
            ..quiet()
        },
    );
    let (mut stream, handle) = client.subscribe(&["orders"]).await.expect("subscribe");

    sleep(Duration::from_millis(250)).await;
    assert!(server.count("PING") >= 2);

    server.publish("orders", b"after pings");
    let message = next_message(&mut stream).await;
    assert_eq!(&message.payload[..], b"after pings");
    assert!(stream.try_recv().is_none());
    handle.close().await.expect("close");
}

#[tokio::test]
async fn dropping_handle_unsubscribes() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());
    let (mut stream, handle) = client.subscribe(&["orders"]).await.expect("subscribe");

    drop(handle);
    assert!(next(&mut stream).await.is_none());
    server.wait_for_command("UNSUBSCRIBE").await;
    assert_eq!(client.pool_stats().total, 0);
}

#[tokio::test]
async fn dropping_stream_closes_subscription() {
    let server = FakeServer::start(Behavior::default()).await;
    let client = client_for(&server, quiet());
    let (stream, handle) = client.subscribe(&["orders"]).await.expect("subscribe");

    drop(stream);
    server.publish("orders", b"nobody listening");
    timeout(WAIT, async {
        while !handle.is_closed() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscription never closed");
    server.wait_for_command("UNSUBSCRIBE").await;
}

#[tokio::test]
async fn unconfirmed_subscribe_times_out() {
    let server = FakeServer::start(Behavior {
        silent_subscribe: true,
        ..Behavior::default()
    })
    .await;
    let client = client_for(
        &server,
        PubSubConfig {
            handshake_timeout: Duration::from_millis(200),
            ..quiet()
        },
    );

    match timeout(WAIT, client.subscribe(&["orders"])).await.expect("subscribe stalled") {
        Err(ClientError::SubscribeFailed(cause)) => {
            assert!(matches!(*cause, ClientError::Timeout))
        }
        Err(other) => panic!("expected subscribe failure, got {:?}", other),
        Ok(_) => panic!("subscribe unexpectedly succeeded"),
    }
    assert_eq!(client.pool_stats().total, 0);
}

#[tokio::test]
async fn publishes_during_handshake_arrive_first() {
    let server = FakeServer::start(Behavior {
        publish_during_handshake: true,
        ..Behavior::default()
    })
    .await;
    let client = client_for(&server, quiet());
    let (mut stream, handle) = client.subscribe(&["a", "b"]).await.expect("subscribe");
    assert_eq!(handle.active_channels(), 2);

    server.publish("a", b"late");
    let payloads = [
        next_message(&mut stream).await.payload,
        next_message(&mut stream).await.payload,
        next_message(&mut stream).await.payload,
    ];
    assert_eq!(&payloads[0][..], b"early-1");
    assert_eq!(&payloads[1][..], b"early-2");
    assert_eq!(&payloads[2][..], b"late");
}

#[tokio::test]
async fn slow_consumer_survives_keepalive() {
    let server = FakeServer::start(Behavior {
        chatter_before_pong: true,
        ..Behavior::default()
    })
    .await;
    let client = client_for(
        &server,
        PubSubConfig {
            keepalive_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(100),
            ..quiet()
        },
    );
    let (mut stream, handle) = client.subscribe(&["feed"]).await.expect("subscribe");

    // Publishes queue ahead of the pong while nobody reads the stream.
    sleep(Duration::from_millis(500)).await;

    for _ in 0..6 {
        let message = next_message(&mut stream).await;
        assert_eq!(message.channel, "feed");
    }
    assert!(!handle.is_closed());
    handle.close().await.expect("close");
    while let Some(item) = next(&mut stream).await {
        assert!(item.is_ok(), "unexpected error item {:?}", item);
    }
}

#[tokio::test]
async fn close_is_bounded_when_server_stops_reading() {
    let server = FakeServer::start(Behavior {
        stall_reads: true,
        ..Behavior::default()
    })
    .await;
    let client = client_for(
        &server,
        PubSubConfig {
            write_timeout: Duration::from_millis(200),
            ..quiet()
        },
    );
    let (_stream, handle) = client.subscribe(&["orders"]).await.expect("subscribe");

    // Far more than the socket buffers hold, so the write cannot complete.
    let huge = "x".repeat(64 * 1024 * 1024);
    let sent = timeout(WAIT, handle.subscribe(&[huge.as_str()]))
        .await
        .expect("subscribe write unbounded");
    assert!(matches!(sent, Err(ClientError::Timeout)));

    let closed = timeout(WAIT, handle.close()).await.expect("close unbounded");
    assert!(!matches!(closed, Err(ClientError::NotConnected)));
    assert!(handle.is_closed());
    assert_eq!(client.pool_stats().total, 0);
    assert!(matches!(handle.close().await, Err(ClientError::NotConnected)));
}
