//! 引擎上下文.
//!
//! 聚合配置、目录存储注册表与任务池, 以 `Arc` 注入各组件.
//! 没有进程级单例: 同一进程可以并存多个互不影响的引擎实例,
//! 各自拥有独立的缓存目录视图与线程池.

use std::sync::Arc;

use chuan_core::EngineConfig;

use crate::downloader::Downloader;
use crate::options::DownloadOptions;
use crate::pool::ThreadPool;
use crate::store_manager::StoreManager;

/// 下载器构造器, 会话按需为每个任务创建传输实例.
///
/// 测试经由此注入内存下载器.
pub type DownloaderFactory = Arc<dyn Fn(Arc<DownloadOptions>) -> Box<dyn Downloader> + Send + Sync>;

/// 引擎上下文
pub struct EngineContext {
    pub config: EngineConfig,
    pub stores: StoreManager,
    pub pool: ThreadPool,
    pub downloader_factory: DownloaderFactory,
}

impl EngineContext {
    /// 以 HTTP 传输构建上下文
    #[cfg(feature = "http")]
    pub fn new(config: EngineConfig) -> Arc<EngineContext> {
        let factory: DownloaderFactory =
            Arc::new(|opts| Box::new(crate::downloader::HttpDownloader::new(opts)));
        EngineContext::with_factory(config, factory)
    }

    /// 以自定义传输构建上下文
    pub fn with_factory(config: EngineConfig, factory: DownloaderFactory) -> Arc<EngineContext> {
        let stores = StoreManager::new(config.range_size as u32);
        let pool = ThreadPool::new(config.thread_pool_size, config.preload_lru);
        Arc::new(EngineContext {
            config,
            stores,
            pool,
            downloader_factory: factory,
        })
    }
}
