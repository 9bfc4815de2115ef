//! 会话级下载选项.
//!
//! 每次 `CacheManager::open` 独立携带一份, 与引擎级 `EngineConfig` 区分:
//! 这里是单个资源的下载参数 (目录、预载大小、HTTP 头等).

/// 下载用途分类, 决定会话进入哪个池
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadType {
    #[default]
    None,
    /// DNS 预热
    Dns,
    /// 预载 (不伴随播放)
    Pre,
    /// 播放数据
    Data,
    /// 封面图
    Pic,
    /// 广告素材
    Ads,
    /// 开屏广告素材
    KaipingAds,
}

impl DownloadType {
    /// 是否进入预载队列 (而非前台专属线程)
    pub fn is_prefetch(&self) -> bool {
        matches!(self, DownloadType::Pre | DownloadType::Pic)
    }

    /// 是否进入广告池
    pub fn is_ads(&self) -> bool {
        matches!(self, DownloadType::Ads | DownloadType::KaipingAds)
    }
}

/// 单资源下载选项
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// 下载用途
    pub download_type: DownloadType,

    /// 预载目标字节数, 0 表示整个文件 (仅预载会话使用)
    pub preload_bytes: i64,

    /// 缓存目录, 为空则不落盘
    pub cache_dir: String,

    /// 该目录下缓存条目上限
    pub cache_max_entries: u32,

    /// 该目录物理容量上限 (字节)
    pub cache_max_capacity: i64,

    /// 额外 HTTP 头, 形如 "Name: value"
    pub headers: Vec<String>,

    /// User-Agent
    pub user_agent: String,

    /// Referer, 为空则不携带
    pub referer: String,

    /// 传输失败重试上限
    pub max_retry: u32,

    /// 建连超时 (微秒)
    pub connect_timeout_us: i64,

    /// 低速判定阈值 (字节每秒), 0 关闭
    pub low_speed_limit: i32,

    /// 低速持续时长判定 (毫秒)
    pub low_speed_time_ms: i32,

    /// 读取是否走异步路径 (下载线程后台填充)
    pub read_async: bool,

    /// 是否读写磁盘缓存
    pub load_from_file: bool,

    /// 是否直播流 (不可 seek, 不落盘)
    pub is_live: bool,

    /// URL 列表分隔符, 为空表示不支持多源
    pub url_list_separator: String,

    /// 是否将 http 升级为 https
    pub use_https: bool,

    /// 解密 token (base64), 为空表示数据未加密
    pub token: String,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        DownloadOptions {
            download_type: DownloadType::None,
            preload_bytes: 0,
            cache_dir: String::new(),
            cache_max_entries: 20,
            cache_max_capacity: 300 * 1024 * 1024,
            headers: Vec::new(),
            user_agent: "ChuanFetch".to_string(),
            referer: String::new(),
            max_retry: 5,
            connect_timeout_us: 3_000_000,
            low_speed_limit: 1,
            low_speed_time_ms: 3000,
            read_async: true,
            load_from_file: true,
            is_live: false,
            url_list_separator: String::new(),
            use_https: false,
            token: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_expectations() {
        let opts = DownloadOptions::default();
        assert_eq!(opts.cache_max_entries, 20);
        assert_eq!(opts.cache_max_capacity, 300 * 1024 * 1024);
        assert_eq!(opts.max_retry, 5);
        assert!(opts.read_async);
        assert!(opts.load_from_file);
    }

    #[test]
    fn download_type_routing() {
        assert!(DownloadType::Pre.is_prefetch());
        assert!(!DownloadType::Data.is_prefetch());
        assert!(DownloadType::KaipingAds.is_ads());
    }
}
