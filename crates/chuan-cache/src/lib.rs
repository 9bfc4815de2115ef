//! # chuan-cache
//!
//! Chuan 缓存引擎主体: 分段磁盘存储、HTTP 范围下载、内存窗口会话
//! 与多池会话管理.
//!
//! 模块分层 (自底向上):
//!
//! | 模块 | 职责 |
//! |------|------|
//! | `store` | 单目录分段磁盘缓存, LRU 淘汰 |
//! | `store_manager` | 目录到存储实例的注册表 |
//! | `downloader` | 范围下载抽象与 HTTP 实现 |
//! | `task` | 下载任务线程与参数交接 |
//! | `pool` | 预载工作线程池与前台专属线程 |
//! | `session` | 内存窗口会话: 阻塞 Read/Seek, 序列号防陈旧写入 |
//! | `manager` | playing / precache / ads 三池准入调度 |
//! | `context` | 引擎上下文, 聚合配置、存储与线程池 |

pub mod context;
pub mod downloader;
pub mod manager;
pub mod options;
pub mod pool;
pub mod session;
pub mod store;
pub mod store_manager;
pub mod task;
pub mod token;

// 重导出常用类型
pub use context::{DownloaderFactory, EngineContext};
pub use downloader::{DataSink, DownloadStatus, Downloader, RangeSpec, WriteOutcome};
pub use manager::CacheManager;
pub use options::{DownloadOptions, DownloadType};
pub use pool::ThreadPool;
pub use session::{CacheSession, SEEK_SIZE};
pub use store::{SegmentEntry, SegmentStore};
pub use store_manager::StoreManager;
pub use task::DownloadTask;
pub use token::TokenInfo;
