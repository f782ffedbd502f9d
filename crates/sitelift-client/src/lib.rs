pub mod config;
pub mod dispatcher;
pub mod notify;
pub mod realtime;
pub mod session;

pub use config::ClientConfig;
pub use dispatcher::{ApiRequest, DispatcherConfig, Payload, RequestDispatcher, RequestHandle};
pub use notify::NotificationBridge;
pub use realtime::{ConnectionState, RealtimeConfig, RealtimeConnection, Transport, WebSocketTransport};
pub use session::Session;
