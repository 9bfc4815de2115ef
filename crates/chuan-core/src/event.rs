//! 下载事件模型.
//!
//! 引擎通过 `EventListener` 向宿主 (播放器内核) 上报下载过程中的
//! 关键节点: HTTP 建连、DNS 解析、流量、缓存统计、换源与错误.
//! 事件载荷全部为值类型, 借引用传递, 监听方不承担释放责任.

/// HTTP 建连事件载荷
#[derive(Debug, Clone, Default)]
pub struct HttpEvent {
    pub url: String,
    pub offset: i64,
    pub error: i32,
    pub http_code: i32,
    pub file_size: i64,
    pub wan_ip: String,
    /// 毫秒
    pub http_rtt: i32,
}

/// TCP 建连事件载荷
#[derive(Debug, Clone, Default)]
pub struct TcpEvent {
    pub error: i32,
    pub family: i32,
    pub ip: String,
    pub port: i32,
    /// 毫秒
    pub tcp_rtt: i32,
    pub url: String,
}

/// DNS 解析结果
#[derive(Debug, Clone, Default)]
pub struct DnsInfo {
    pub domain: String,
    pub ip: String,
    pub family: i32,
    pub port: i32,
    /// 0 失败, 1 成功
    pub status: i32,
}

/// 网络流量上报
#[derive(Debug, Clone, Default)]
pub struct IoTraffic {
    pub url: String,
    pub bytes: i64,
    pub cached_bytes: i64,
    pub cache_path: String,
}

/// 缓存命中统计, 会话打开时上报一次
#[derive(Debug, Clone, Default)]
pub struct CacheStatistic {
    pub cached_size: i64,
    pub logical_file_size: i64,
}

/// 分片下载完成 (预载目标达成) 上报
#[derive(Debug, Clone, Default)]
pub struct FragmentInfo {
    pub url: String,
    pub bytes: i64,
}

/// 换源事件: 前一个地址失败, 切换到列表中的下一个
#[derive(Debug, Clone, Default)]
pub struct UrlChange {
    pub current_url: String,
    pub http_code: i32,
    pub next_url: String,
}

/// 错误上报
#[derive(Debug, Clone, Default)]
pub struct ErrorEvent {
    pub url: String,
    pub error: i32,
}

/// 下载事件
#[derive(Debug, Clone)]
pub enum Event {
    WillDnsParse(DnsInfo),
    DidDnsParse(DnsInfo),
    WillTcpOpen(TcpEvent),
    DidTcpOpen(TcpEvent),
    WillHttpOpen(HttpEvent),
    DidHttpOpen(HttpEvent),
    IoTraffic(IoTraffic),
    CacheStatistic(CacheStatistic),
    FragmentComplete(FragmentInfo),
    UrlChange(UrlChange),
    Error(ErrorEvent),
    /// 会话已完全释放
    Release,
}

/// 下载事件监听器
///
/// 实现方决定消费哪些事件; `is_interrupted` 由阻塞读取路径轮询,
/// 返回 true 时读取立即放弃等待.
pub trait EventListener: Send + Sync {
    /// 事件上报
    fn on_event(&self, event: &Event);

    /// 宿主是否要求中断当前阻塞操作
    fn is_interrupted(&self) -> bool {
        false
    }

    /// 下载速度采样 (字节数, 字节每秒, 采样时刻毫秒)
    fn on_speed(&self, _bytes: i64, _bytes_per_sec: i64, _timestamp_ms: i64) {}
}

/// 空监听器, 丢弃所有事件
#[derive(Debug, Default)]
pub struct NoopListener;

impl EventListener for NoopListener {
    fn on_event(&self, _event: &Event) {}
}
