//! 服务模块 - 包含服务启动、依赖注入与启动信息展示

pub mod bootstrap;
pub mod startup;
pub mod wire;

pub use bootstrap::ApplicationBootstrap;
pub use startup::StartupInfo;
pub use wire::{ApplicationContext, Infrastructure};
