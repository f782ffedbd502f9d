//! Scripted in-memory transport for connection state machine tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::{FutureExt, SinkExt, StreamExt};
use sitelift_core::error::AppError;
use tokio::time::Instant;

use super::transport::{InboundStream, OutboundSink, Transport};

/// What the next `open` call does.
#[derive(Debug, Clone, Copy)]
pub enum OpenBehavior {
    Accept,
    Fail,
    /// Never resolves; exercises the connect timeout.
    Hang,
    /// Accept after a delay.
    Delay(Duration),
}

/// The server end of one accepted connection.
pub struct MockPeer {
    /// Dropping this closes the connection from the server side.
    pub to_client: mpsc::UnboundedSender<Result<String, AppError>>,
    /// Dropping this makes every client write fail.
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl MockPeer {
    pub fn push(&self, text: &str) {
        let _ = self.to_client.unbounded_send(Ok(text.to_string()));
    }

    /// Everything the client has written so far.
    pub fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(Some(text)) = self.from_client.next().now_or_never() {
            out.push(text);
        }
        out
    }
}

#[derive(Default)]
struct MockInner {
    script: VecDeque<OpenBehavior>,
    fallback: Option<OpenBehavior>,
    opens: Vec<(String, Instant)>,
    peers: VecDeque<MockPeer>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

impl MockTransport {
    /// Every open is accepted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Play `script` in order, then `fallback` forever.
    pub fn scripted(script: Vec<OpenBehavior>, fallback: OpenBehavior) -> Self {
        let transport = Self::default();
        {
            let mut inner = transport.inner.lock().unwrap();
            inner.script = script.into();
            inner.fallback = Some(fallback);
        }
        transport
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap().opens.len()
    }

    pub fn opened_urls(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .opens
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.inner
            .lock()
            .unwrap()
            .opens
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }

    /// The server end of the oldest accepted connection not yet taken.
    pub fn take_peer(&self) -> Option<MockPeer> {
        self.inner.lock().unwrap().peers.pop_front()
    }

    fn accept(&self) -> (OutboundSink, InboundStream) {
        let (client_tx, peer_rx) = mpsc::unbounded::<String>();
        let (peer_tx, client_rx) = mpsc::unbounded::<Result<String, AppError>>();

        self.inner.lock().unwrap().peers.push_back(MockPeer {
            to_client: peer_tx,
            from_client: peer_rx,
        });

        let sink = client_tx
            .sink_map_err(|e| AppError::ConnectionClosed(format!("mock write failed: {e}")));
        (Box::pin(sink), client_rx.boxed())
    }
}

impl Transport for MockTransport {
    async fn open(&self, url: &str) -> Result<(OutboundSink, InboundStream), AppError> {
        let behavior = {
            let mut inner = self.inner.lock().unwrap();
            inner.opens.push((url.to_string(), Instant::now()));
            inner
                .script
                .pop_front()
                .or(inner.fallback)
                .unwrap_or(OpenBehavior::Accept)
        };

        match behavior {
            OpenBehavior::Accept => Ok(self.accept()),
            OpenBehavior::Fail => Err(AppError::NetworkError("mock refused".into())),
            OpenBehavior::Hang => {
                futures::future::pending::<()>().await;
                Err(AppError::NetworkError("unreachable".into()))
            }
            OpenBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.accept())
            }
        }
    }
}
