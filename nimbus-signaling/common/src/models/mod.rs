//! 信令服务共享数据模型

mod device;
mod envelope;
mod message_type;
mod presence;

pub use device::DeviceGroup;
pub use envelope::{Envelope, EnvelopeBuilder};
pub use message_type::MessageType;
pub use presence::{DriverInfo, PresenceRecord, PresenceUpdate};

/// 回复元数据键
pub mod metadata_keys {
    pub const PLATFORM: &str = "platform";
    pub const DEVICE_TYPE: &str = "deviceType";
    pub const BROKER_ID: &str = "brokerId";
    pub const USER_ID: &str = "userId";
    pub const MESSAGE_ID: &str = "messageId";
    pub const ERROR: &str = "error";
}
