use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

enum ServerCommand {
    Send(String),
    Close,
}

#[derive(Default)]
struct ServerState {
    reject_with: Option<u16>,
    request_uris: Vec<String>,
    received: Vec<String>,
    peers: Vec<mpsc::UnboundedSender<ServerCommand>>,
}

/// Loopback WebSocket server. Answers `ping` envelopes with `pong` and
/// records every other text frame.
pub struct WsServer {
    pub url: String,
    state: Arc<Mutex<ServerState>>,
    task: JoinHandle<()>,
}

impl WsServer {
    pub async fn start() -> Self {
        Self::spawn(None).await
    }

    /// Fail every handshake with `status`.
    pub async fn rejecting(status: u16) -> Self {
        Self::spawn(Some(status)).await
    }

    async fn spawn(reject_with: Option<u16>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ServerState {
            reject_with,
            ..ServerState::default()
        }));

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self {
            url: format!("ws://{addr}/socket"),
            state,
            task,
        }
    }

    pub fn request_uris(&self) -> Vec<String> {
        self.state.lock().unwrap().request_uris.clone()
    }

    pub fn received(&self) -> Vec<String> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().peers.len()
    }

    /// Send a text frame on the most recent connection.
    pub fn push(&self, text: &str) {
        if let Some(peer) = self.state.lock().unwrap().peers.last() {
            let _ = peer.send(ServerCommand::Send(text.to_string()));
        }
    }

    /// Close every connection from the server side.
    pub fn close_all(&self) {
        for peer in &self.state.lock().unwrap().peers {
            let _ = peer.send(ServerCommand::Close);
        }
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<ServerState>>) {
    let handshake_state = state.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let mut state = handshake_state.lock().unwrap();
        state.request_uris.push(req.uri().to_string());
        match state.reject_with {
            Some(status) => Err(http::Response::builder()
                .status(status)
                .body(None)
                .unwrap()),
            None => Ok(resp),
        }
    };

    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.lock().unwrap().peers.push(tx);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(ServerCommand::Send(text)) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(ServerCommand::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let text = text.to_string();
                    if is_ping(&text) {
                        let pong = r#"{"type":"pong","data":null,"timestamp":0}"#;
                        if write.send(Message::Text(pong.into())).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    state.lock().unwrap().received.push(text);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

fn is_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
        .unwrap_or(false)
}
