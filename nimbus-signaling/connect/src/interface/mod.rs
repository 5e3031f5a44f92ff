//! 接口层：客户端长连接（TCP / WebSocket）与总线消费者

pub mod connection;
pub mod gate;
pub mod runtime;
pub mod tcp;
pub mod websocket;

pub use connection::{ConnectionRuntime, ConnectionSettings, InboundFrame};
pub use gate::{AuthGate, HandshakeCredentials};
pub use runtime::NodeQueueConsumer;
pub use tcp::TcpSignalingServer;
pub use websocket::WebSocketSignalingServer;
