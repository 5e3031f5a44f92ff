//! 应用层服务模块
//!
//! 负责连接生命周期与下行分发的流程编排

pub mod connection_service;
pub mod dispatch_service;

pub use connection_service::{ConnectionApplicationService, ConnectionServiceOptions, LoginOutcome};
pub use dispatch_service::{DispatchOutcome, NodeDispatchService};
