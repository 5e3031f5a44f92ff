//! Nimbus Signaling Common
//!
//! 信令服务共享代码库，包含：
//! - 共享数据模型 (models)：Envelope、消息类型、设备分组、在线记录
//! - 编解码 (codec)：二进制 / JSON 双协议与长度前缀分帧
//! - 在线目录 (presence)：Redis 与内存实现
//! - 消息总线 (bus)：Kafka 与内存实现
//! - 共享错误类型 (error)
//!
//! 被 connect、router 两个子模块共同使用

pub mod bus;
pub mod codec;
pub mod error;
pub mod models;
pub mod presence;

// 导出常用类型
pub use error::{SignalingError, SignalingResult};
pub use models::*;
