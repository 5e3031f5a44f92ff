pub mod auth;
pub mod notifier;
pub mod upstream;

pub use auth::JwtTokenService;
pub use notifier::BusNodeNotifier;
pub use upstream::{BusUpstreamForwarder, LoggingUpstreamForwarder};
