//! 引擎级配置.
//!
//! 所有配置在引擎构建时一次性给定, 之后只读共享.
//! 会话级选项 (缓存目录、预载大小等) 见 `chuan-cache` 的 `DownloadOptions`.

/// 下载分片大小, 内存窗口与磁盘分段都按此对齐
pub const DEFAULT_RANGE_SIZE: usize = 1024 * 1024;

/// 内存窗口额外余量上限
pub const MAX_BUFFER_EXTRA: usize = 10 * 1024 * 1024;

/// 预载任务重复提交时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LruMode {
    /// 丢弃重复提交, 队列先进先出
    #[default]
    Fifo,
    /// 重复提交将任务移到队首 (最近提交优先)
    Lru,
    /// 拒绝重复提交并报错
    Reject,
}

/// 引擎全局配置
///
/// 构建 `EngineContext` 时传入, 不存在进程级单例:
/// 同一进程可以携带多个互不影响的引擎实例.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 预载工作线程数
    pub thread_pool_size: usize,

    /// 下载分片大小 (内存窗口宽度, 磁盘分段宽度)
    pub range_size: usize,

    /// 内存窗口额外余量, 默认 2 倍分片, 受 `MAX_BUFFER_EXTRA` 约束
    pub buffer_extra_size: usize,

    /// 读取无进展时的重试窗口数, 每个窗口约 1 秒, 超过即判超时
    pub retry_count: u32,

    /// 预载任务重复提交策略
    pub preload_lru: LruMode,

    /// 正在播放的 URL 是否允许再次发起预载
    pub preload_reopen: bool,

    /// 每个会话池的容量上限
    pub max_sessions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            thread_pool_size: 1,
            range_size: DEFAULT_RANGE_SIZE,
            buffer_extra_size: 2 * DEFAULT_RANGE_SIZE,
            retry_count: 3,
            preload_lru: LruMode::Fifo,
            preload_reopen: false,
            max_sessions: 10,
        }
    }
}

impl EngineConfig {
    /// 校正后的窗口余量, 不超过 `MAX_BUFFER_EXTRA`
    pub fn clamped_extra_size(&self) -> usize {
        self.buffer_extra_size.min(MAX_BUFFER_EXTRA)
    }
}
