use std::sync::{Arc, Mutex};
use std::time::Duration;

use sitelift_client::{ConnectionState, RealtimeConfig, RealtimeConnection};
use sitelift_core::backoff::ReconnectPolicy;
use sitelift_core::error::AppError;
use sitelift_core::events::{ConnectionEvent, RealtimeEvent, Topic};
use sitelift_core::models::Envelope;

use crate::integration::common::{WsServer, eventually, init_tracing};

fn fast_reconnect(url: &str) -> RealtimeConfig {
    RealtimeConfig::new(url).with_reconnect(
        ReconnectPolicy::default()
            .with_base_delay(Duration::from_millis(50))
            .with_max_delay(Duration::from_millis(200)),
    )
}

fn record_connection_events(conn: &RealtimeConnection) -> Arc<Mutex<Vec<ConnectionEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    conn.on(Topic::Connection, move |event| {
        if let RealtimeEvent::Connection(e) = event {
            sink.lock().unwrap().push(e.clone());
        }
    });
    seen
}

#[tokio::test]
async fn connect_sends_token_and_exchanges_messages() {
    init_tracing();
    let server = WsServer::start().await;
    let conn = RealtimeConnection::websocket(RealtimeConfig::new(server.url.clone()));

    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    conn.on(Topic::message("job_update"), move |event| {
        if let RealtimeEvent::Message(envelope) = event {
            sink.lock().unwrap().push(envelope.data.clone());
        }
    });

    conn.connect(Some("secret")).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Open);
    assert_eq!(server.request_uris(), vec!["/socket?token=secret"]);

    conn.send("hello", serde_json::json!({"n": 1})).await.unwrap();
    eventually("server to receive hello", || !server.received().is_empty()).await;
    let envelope: Envelope = serde_json::from_str(&server.received()[0]).unwrap();
    assert_eq!(envelope.kind, "hello");
    assert_eq!(envelope.data, serde_json::json!({"n": 1}));
    assert!(envelope.timestamp > 0);

    server.push(r#"{"type":"job_update","data":{"progress":50},"timestamp":1}"#);
    eventually("job_update handler", || !updates.lock().unwrap().is_empty()).await;
    assert_eq!(updates.lock().unwrap()[0], serde_json::json!({"progress": 50}));

    conn.shutdown().await;
}

#[tokio::test]
async fn server_close_triggers_reconnect() {
    init_tracing();
    let server = WsServer::start().await;
    let conn = RealtimeConnection::websocket(fast_reconnect(&server.url));
    let events = record_connection_events(&conn);

    conn.connect(Some("secret")).await.unwrap();
    server.close_all();

    eventually("second connection", || server.connection_count() == 2).await;
    eventually("reconnected state", || conn.is_connected()).await;
    assert_eq!(conn.reconnect_attempts(), 0);

    let events = events.lock().unwrap().clone();
    assert_eq!(events[0], ConnectionEvent::Connected);
    assert!(matches!(
        events[1],
        ConnectionEvent::Disconnected {
            permanent: false,
            ..
        }
    ));
    assert_eq!(events[2], ConnectionEvent::Connected);

    // The reconnect reuses the stored credential.
    assert_eq!(
        server.request_uris(),
        vec!["/socket?token=secret", "/socket?token=secret"]
    );
    conn.shutdown().await;
}

#[tokio::test]
async fn disconnect_stays_closed() {
    init_tracing();
    let server = WsServer::start().await;
    let conn = RealtimeConnection::websocket(fast_reconnect(&server.url));

    conn.connect(None).await.unwrap();
    conn.disconnect().await;
    assert_eq!(conn.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.connection_count(), 1);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn rejected_handshake_reports_unauthorized() {
    init_tracing();
    let server = WsServer::rejecting(401).await;
    let conn = RealtimeConnection::websocket(RealtimeConfig::new(server.url.clone()));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    conn.on(Topic::Error, move |event| {
        if let RealtimeEvent::Error(e) = event {
            sink.lock().unwrap().push(e.message.clone());
        }
    });

    let err = conn.connect(Some("expired")).await.unwrap_err();
    match err {
        AppError::ConnectionClosed(msg) => assert!(msg.contains("Unauthorized")),
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(errors.lock().unwrap().len(), 1);
}
