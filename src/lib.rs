//! # Chuan (川)
//!
//! 纯 Rust 实现的播放器分段下载缓存引擎, 对标播放器内核的下载缓存子系统.
//!
//! Chuan 提供了完整的边下边播能力:
//! - **分段磁盘缓存**: 按范围寻址的 HTTP 字节缓存, LRU 淘汰
//! - **内存窗口会话**: 阻塞式 Read/Seek, 序列号防陈旧写入
//! - **下载任务池**: 前台播放专属线程 + 预载任务队列
//! - **缓存管理器**: playing / precache / ads 三池准入调度
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chuan::cache::{CacheManager, DownloadOptions, DownloadType};
//! use chuan::core::EngineConfig;
//! use chuan::core::event::NoopListener;
//!
//! let manager = CacheManager::new(EngineConfig::default());
//! let mut opts = DownloadOptions::default();
//! opts.cache_dir = "/tmp/chuan-cache".into();
//! opts.download_type = DownloadType::Pre;
//! opts.preload_bytes = 1024 * 1024;
//! let id = manager.open("https://example.com/v.mp4", opts, Arc::new(NoopListener)).unwrap();
//! manager.close("https://example.com/v.mp4", id);
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `chuan-core` | 核心类型: 错误、配置、URL、事件 |
//! | `chuan-cache` | 缓存引擎: 分段存储、下载任务、会话、管理器 |

/// 核心类型与工具
pub use chuan_core as core;

/// 缓存引擎
pub use chuan_cache as cache;

// 重导出常用类型
pub use chuan_cache::{CacheManager, CacheSession, DownloadOptions, DownloadType, SegmentStore};
pub use chuan_core::{ChuanError, ChuanResult, EngineConfig};

/// 获取 Chuan 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
