use std::future::Future;
use std::pin::Pin;

use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt, future};
use sitelift_core::error::AppError;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

/// Write half of an open duplex connection, one text frame per item.
pub type OutboundSink = Pin<Box<dyn Sink<String, Error = AppError> + Send>>;

/// Read half of an open duplex connection. Ends when the peer closes.
pub type InboundStream = BoxStream<'static, Result<String, AppError>>;

/// Opens duplex text connections. The realtime connection is generic over
/// this so its state machine can be driven without a network.
pub trait Transport: Send + Sync + 'static {
    fn open(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<(OutboundSink, InboundStream), AppError>> + Send;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<(OutboundSink, InboundStream), AppError> {
        let (ws, _response) = connect_async(url).await.map_err(map_connect_error)?;
        let (write, read) = ws.split();

        let sink = write
            .with(|text: String| future::ready(Ok::<_, tungstenite::Error>(Message::Text(text.into()))))
            .sink_map_err(|e| AppError::ConnectionClosed(format!("WebSocket write failed: {e}")));

        let stream = read
            .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            tracing::warn!(bytes = data.len(), "Dropping non-UTF-8 binary frame");
                            None
                        }
                    },
                    // Protocol-level ping/pong is answered by tungstenite itself.
                    Ok(_) => None,
                    Err(e) => Some(Err(AppError::ConnectionClosed(format!(
                        "WebSocket read failed: {e}"
                    )))),
                })
            });

        Ok((Box::pin(sink), stream.boxed()))
    }
}

fn map_connect_error(err: tungstenite::Error) -> AppError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            match status {
                401 => AppError::ConnectionClosed(
                    "Unauthorized: realtime endpoint requires a valid token".into(),
                ),
                403 => AppError::ConnectionClosed("Forbidden: realtime access denied".into()),
                code => AppError::ConnectionClosed(format!("WebSocket HTTP error: {code}")),
            }
        }
        tungstenite::Error::Io(e) => AppError::NetworkError(format!("Connection failed: {e}")),
        other => AppError::NetworkError(format!("WebSocket handshake failed: {other}")),
    }
}
