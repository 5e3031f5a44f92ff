//! 领域层：业务消息模型、投递台账、消息存储接口与总线路由

pub mod model;
pub mod repository;
pub mod service;
