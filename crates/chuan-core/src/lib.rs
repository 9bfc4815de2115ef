//! # chuan-core
//!
//! Chuan 缓存引擎核心库, 提供基础类型定义、错误处理和工具函数.
//!
//! 本 crate 为整个 Chuan 引擎提供底层基础设施: 统一错误类型、
//! 引擎配置、URL 解析与缓存键推导、以及下载事件模型.

pub mod config;
pub mod error;
pub mod event;
pub mod url;

// 重导出常用类型
pub use config::{EngineConfig, LruMode};
pub use error::{ChuanError, ChuanResult};
pub use event::{Event, EventListener};
pub use url::UrlParser;
