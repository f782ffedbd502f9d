//! Wires the dispatcher, the realtime connection and the orchestrator
//! together for one signed-in user.

use sitelift_core::error::AppError;
use sitelift_core::job::{ExtractionJob, ExtractionRequest};
use sitelift_core::orchestrator::ExtractionOrchestrator;
use sitelift_core::traits::{ExtractionSource, NotificationSink, TokenStore};

use crate::config::ClientConfig;
use crate::dispatcher::RequestDispatcher;
use crate::notify::NotificationBridge;
use crate::realtime::{RealtimeConnection, Transport, WebSocketTransport};

pub struct Session<T: TokenStore, X: Transport = WebSocketTransport> {
    dispatcher: RequestDispatcher<T>,
    connection: RealtimeConnection<X>,
    orchestrator: ExtractionOrchestrator<RequestDispatcher<T>>,
}

impl<T: TokenStore> Session<T> {
    pub fn new(config: ClientConfig, tokens: T) -> Result<Self, AppError> {
        Self::with_transport(config, tokens, WebSocketTransport)
    }
}

impl<T: TokenStore, X: Transport> Session<T, X> {
    pub fn with_transport(config: ClientConfig, tokens: T, transport: X) -> Result<Self, AppError> {
        let dispatcher = RequestDispatcher::new(config.dispatcher, tokens)?;
        let connection = RealtimeConnection::new(transport, config.realtime);
        let orchestrator = ExtractionOrchestrator::new(dispatcher.clone());
        Ok(Self {
            dispatcher,
            connection,
            orchestrator,
        })
    }

    pub fn dispatcher(&self) -> &RequestDispatcher<T> {
        &self.dispatcher
    }

    pub fn connection(&self) -> &RealtimeConnection<X> {
        &self.connection
    }

    pub fn orchestrator(&self) -> &ExtractionOrchestrator<RequestDispatcher<T>> {
        &self.orchestrator
    }

    /// Route `notification` and `extraction_complete` pushes to `sink`.
    pub fn forward_notifications<S: NotificationSink>(&self, sink: S) -> NotificationBridge<X> {
        NotificationBridge::attach(&self.connection, sink)
    }

    /// Open the realtime channel with the user's credential.
    pub async fn sign_in(&self, token: &str) -> Result<(), AppError> {
        match self.connection.connect(Some(token)).await {
            Ok(()) => {
                tracing::info!("Realtime channel connected after sign-in");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect realtime channel");
                Err(e)
            }
        }
    }

    pub async fn sign_out(&self) {
        self.connection.disconnect().await;
        tracing::info!("Realtime channel closed after sign-out");
    }

    pub async fn extract<S: ExtractionSource>(
        &self,
        request: &ExtractionRequest,
        source: &S,
    ) -> Result<ExtractionJob, AppError> {
        self.orchestrator.run(request, source).await
    }

    /// Cancel every in-flight request, then close the connection and drop
    /// its subscriptions.
    pub async fn shutdown(&self) {
        let cancelled = self.dispatcher.shutdown();
        self.connection.shutdown().await;
        tracing::info!(cancelled, "Session shut down");
    }
}
