//! Nimbus 接入节点
//!
//! 维护客户端长连接（TCP / WebSocket），负责：
//! - 鉴权闸门：连接上的第一个单元必须携带有效凭证
//! - 设备会话表：同一用户每个设备分组最多一个会话，冲突时踢下旧会话
//! - 在线目录：登录写入、心跳续期、孤立断开时由本节点删除
//! - 节点分发：消费本节点独占队列，写给本地会话或强制下线

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;
pub mod service;

#[cfg(test)]
mod test_support;

pub use config::ConnectConfig;
pub use service::{ApplicationBootstrap, ApplicationContext};
