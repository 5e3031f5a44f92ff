pub mod limiter;
pub mod session_registry;

pub use limiter::{ConnectionLimiter, LimitDecision, MessageRateLimiter};
pub use session_registry::{
    AddSessionOutcome, AdmissionSnapshot, DeviceSessionRegistry, KickReason, RegistryOptions,
};
