//! 后台运行任务

pub mod consumer;

pub use consumer::NodeQueueConsumer;
