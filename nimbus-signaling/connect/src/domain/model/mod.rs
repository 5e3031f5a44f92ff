pub mod connection;
pub mod identity;
pub mod session;

pub use connection::{ConnectionHandle, DEFAULT_OUTBOUND_CAPACITY, Outbound, SendError, SessionBinding};
pub use identity::ConnectionIdentity;
pub use session::Session;
