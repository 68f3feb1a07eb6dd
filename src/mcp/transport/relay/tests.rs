use super::*;
use crate::core::credentials::{CredentialError, StaticToken};
use crate::mcp::protocol::RequestId;
use std::sync::atomic::AtomicUsize;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;

type ServerSocket = WebSocketStream<TcpStream>;

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("addr"));
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (tcp, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("timed out waiting for connection")
        .expect("accept");
    accept_async(tcp).await.expect("handshake")
}

async fn next_frame(socket: &mut ServerSocket) -> Message {
    tokio::time::timeout(Duration::from_secs(10), socket.next())
        .await
        .expect("timed out waiting for frame")
        .expect("socket ended")
        .expect("frame")
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

fn settings(url: &str) -> RelaySettings {
    RelaySettings {
        url: url.to_string(),
        credentials: Arc::new(StaticToken::new("secret")),
        keep_alive: Duration::from_secs(20),
        max_reconnect_attempts: 2,
        reconnect_base_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(40),
    }
}

fn token_of(frame: Message) -> String {
    match frame {
        Message::Text(text) => {
            let value: serde_json::Value = serde_json::from_str(&text).expect("json");
            value["Token"].as_str().expect("token").to_string()
        }
        other => panic!("expected token frame, got {other:?}"),
    }
}

#[test]
fn backoff_doubles_and_caps() {
    let base = Duration::from_millis(500);
    let max = Duration::from_secs(30);
    assert_eq!(backoff_delay(base, max, 0), Duration::from_millis(500));
    assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(1));
    assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(4));
    assert_eq!(backoff_delay(base, max, 10), max);
    assert_eq!(backoff_delay(base, max, u32::MAX), max);
}

#[test]
fn settings_require_a_websocket_url() {
    let credentials: Arc<dyn CredentialSource> = Arc::new(StaticToken::new("t"));
    let missing = RelayConfig::default();
    assert!(RelaySettings::from_config(&missing, credentials.clone()).is_err());

    let http = RelayConfig {
        url: Some("https://relay.example".into()),
        ..Default::default()
    };
    assert!(RelaySettings::from_config(&http, credentials.clone()).is_err());

    let ok = RelayConfig {
        url: Some("wss://relay.example/hub".into()),
        keep_alive_seconds: Some(7),
        ..Default::default()
    };
    let settings = RelaySettings::from_config(&ok, credentials).expect("settings");
    assert_eq!(settings.keep_alive, Duration::from_secs(7));
    assert_eq!(settings.max_reconnect_attempts, 8);
}

#[tokio::test]
async fn authenticates_binds_session_and_exchanges_messages() {
    let (listener, url) = listener().await;
    let transport = RelayTransport::new(settings(&url));
    let mut events = transport.take_events().expect("events");

    let (started, mut server) = tokio::join!(transport.start(), accept(&listener));
    started.expect("start");
    assert_eq!(token_of(next_frame(&mut server).await), "secret");

    server
        .send(Message::Text(r#"{"CorrelationId":"abc"}"#.to_string()))
        .await
        .expect("control");
    let request = JsonRpcMessage::request(RequestId::Number(1), "tools/list", None);
    server
        .send(Message::Binary(encode_line(&request).expect("encode")))
        .await
        .expect("binary");

    assert_eq!(next_event(&mut events).await, TransportEvent::Message(request));
    assert_eq!(transport.session_id().as_deref(), Some("abc"));

    server
        .send(Message::Text(r#"{"CorrelationId":"later"}"#.to_string()))
        .await
        .expect("control");
    server
        .send(Message::Binary(b"not json\n".to_vec()))
        .await
        .expect("binary");
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Error(TransportError::Parse(_))
    ));
    assert_eq!(transport.session_id().as_deref(), Some("abc"));

    let response = JsonRpcMessage::response(RequestId::Number(1), serde_json::json!({"tools": []}));
    transport.send(response.clone()).await.expect("send");
    match next_frame(&mut server).await {
        Message::Binary(bytes) => {
            let text = String::from_utf8(bytes).expect("utf8");
            assert!(text.ends_with('\n'));
            assert_eq!(JsonRpcMessage::parse(text.trim()).expect("parse"), response);
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    transport.close().await;
    assert_eq!(next_event(&mut events).await, TransportEvent::Closed);
    assert!(transport
        .send(JsonRpcMessage::notification("ping", None))
        .await
        .is_err());
}

#[tokio::test]
async fn send_fails_fast_when_not_connected() {
    let transport = RelayTransport::new(settings("ws://127.0.0.1:9"));
    let err = transport
        .send(JsonRpcMessage::notification("ping", None))
        .await
        .expect_err("should fail");
    assert!(matches!(err, TransportError::Connection(_)));
}

#[tokio::test]
async fn first_connect_failure_is_returned_from_start() {
    let (listener, url) = listener().await;
    drop(listener);
    let transport = RelayTransport::new(settings(&url));
    assert!(matches!(
        transport.start().await,
        Err(TransportError::Connection(_))
    ));
    // A later attempt is allowed.
    assert!(transport.start().await.is_err());
}

#[tokio::test]
async fn concurrent_starts_share_one_connection() {
    let (listener, url) = listener().await;
    let transport = RelayTransport::new(settings(&url));

    let (first, second, mut server) =
        tokio::join!(transport.start(), transport.start(), accept(&listener));
    first.expect("first start");
    second.expect("second start");
    assert_eq!(token_of(next_frame(&mut server).await), "secret");

    let extra = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(extra.is_err(), "a second connection was opened");
    transport.start().await.expect("start while connected");
    transport.close().await;
}

#[tokio::test]
async fn concurrent_starts_share_a_failed_connect() {
    let (listener, url) = listener().await;
    drop(listener);
    let transport = RelayTransport::new(settings(&url));

    let (first, second) = tokio::join!(transport.start(), transport.start());
    assert!(matches!(first, Err(TransportError::Connection(_))));
    assert!(matches!(second, Err(TransportError::Connection(_))));
}

#[tokio::test]
async fn keep_alive_resends_the_token() {
    struct Counting(AtomicUsize);

    #[async_trait]
    impl CredentialSource for Counting {
        async fn token(&self) -> Result<String, CredentialError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-{n}"))
        }
    }

    let (listener, url) = listener().await;
    let mut settings = settings(&url);
    settings.credentials = Arc::new(Counting(AtomicUsize::new(0)));
    settings.keep_alive = Duration::from_millis(50);
    let transport = RelayTransport::new(settings);

    let (started, mut server) = tokio::join!(transport.start(), accept(&listener));
    started.expect("start");
    assert_eq!(token_of(next_frame(&mut server).await), "token-0");
    assert_eq!(token_of(next_frame(&mut server).await), "token-1");
    assert_eq!(token_of(next_frame(&mut server).await), "token-2");
    transport.close().await;
}

#[tokio::test]
async fn reconnects_after_unexpected_close() {
    let (listener, url) = listener().await;
    let transport = RelayTransport::new(settings(&url));
    let mut events = transport.take_events().expect("events");

    let (started, mut server) = tokio::join!(transport.start(), accept(&listener));
    started.expect("start");
    let _ = next_frame(&mut server).await;
    drop(server);

    let mut server = accept(&listener).await;
    assert_eq!(token_of(next_frame(&mut server).await), "secret");
    assert!(events.try_recv().is_err());

    transport.close().await;
    assert_eq!(next_event(&mut events).await, TransportEvent::Closed);
}

#[tokio::test]
async fn gives_up_after_bounded_attempts() {
    let (listener, url) = listener().await;
    let transport = RelayTransport::new(settings(&url));
    let mut events = transport.take_events().expect("events");

    let (started, server) = tokio::join!(transport.start(), accept(&listener));
    started.expect("start");
    drop(listener);
    drop(server);

    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Error(TransportError::Connection(_))
    ));
    assert_eq!(next_event(&mut events).await, TransportEvent::Closed);

    transport.close().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn close_stops_reconnection() {
    let (listener, url) = listener().await;
    let transport = RelayTransport::new(settings(&url));

    let (started, server) = tokio::join!(transport.start(), accept(&listener));
    started.expect("start");
    transport.close().await;
    drop(server);

    let reconnect = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(reconnect.is_err(), "transport reconnected after close");
}
