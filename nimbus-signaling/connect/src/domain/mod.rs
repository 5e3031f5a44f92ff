//! 领域层：连接身份、会话与会话表、限流，以及外部协作方接口

pub mod model;
pub mod repository;
pub mod service;
