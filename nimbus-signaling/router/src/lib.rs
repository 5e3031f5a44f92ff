//! 消息路由（发布侧）
//!
//! 供业务服务内嵌：提交单聊、群聊、群组操作、消息操作与音视频信令，
//! 按在线目录把接收者分组到所在接入节点，每个节点发布一次。

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod service;

pub use application::{DeliveryReceipt, DeliveryService};
pub use config::RouterConfig;
pub use domain::model::{
    DeliveryFailure, DeliveryLedger, GroupMessage, GroupOperation, MessageAction, PrivateMessage,
    VideoSignal,
};
pub use domain::repository::MessageStore;
pub use domain::service::{MessageBusRouter, RouteReport};
pub use infrastructure::InMemoryMessageStore;
pub use service::RouterContext;
