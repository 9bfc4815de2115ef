//! 统一错误类型定义.
//!
//! 所有 Chuan crate 共用的错误类型, 支持跨模块传播.
//! `Again` 与 `Eof` 是控制流信号而非故障: 读取路径用 `Again`
//! 通知调用方稍后重试, 用 `Eof` 表示逻辑位置已到文件末尾.

use thiserror::Error;

/// Chuan 引擎统一错误类型
#[derive(Debug, Error)]
pub enum ChuanError {
    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的操作
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 已到达流末尾
    #[error("已到达流末尾")]
    Eof,

    /// 暂无数据, 稍后重试
    #[error("暂无数据, 稍后重试")]
    Again,

    /// 等待数据超时
    #[error("等待数据超时")]
    Timeout,

    /// TCP 连接超时
    #[error("TCP 连接超时")]
    ConnectTimeout,

    /// DNS 解析失败
    #[error("DNS 解析失败: {0}")]
    DnsResolve(String),

    /// 网络传输错误
    #[error("网络传输错误: {0}")]
    Network(String),

    /// HTTP 状态码错误
    #[error("HTTP 错误: 状态码 {0}")]
    Http(u16),

    /// 缓存数据被污染 (服务端返回 HTML/XML 等非媒体内容)
    #[error("缓存数据被污染: {0}")]
    PoisonedData(String),

    /// 缓存内部状态错误
    #[error("缓存错误: {0}")]
    Cache(String),

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

impl ChuanError {
    /// 是否为重试信号
    pub fn is_again(&self) -> bool {
        matches!(self, ChuanError::Again)
    }

    /// 是否为流末尾
    pub fn is_eof(&self) -> bool {
        matches!(self, ChuanError::Eof)
    }

    /// 是否为可通过换源恢复的网络类错误
    pub fn is_recoverable_network(&self) -> bool {
        matches!(
            self,
            ChuanError::Timeout
                | ChuanError::ConnectTimeout
                | ChuanError::DnsResolve(_)
                | ChuanError::Network(_)
                | ChuanError::Http(_)
        )
    }

    /// 对外上报用的错误码, HTTP 状态码直接透出, 其余取内部编号的负值
    pub fn code(&self) -> i32 {
        match self {
            ChuanError::InvalidArgument(_) => -1,
            ChuanError::Unsupported(_) => -2,
            ChuanError::Io(_) => -5,
            ChuanError::Eof => -541_478_725,
            ChuanError::Again => -11,
            ChuanError::Timeout => -110,
            ChuanError::ConnectTimeout => -111,
            ChuanError::DnsResolve(_) => -112,
            ChuanError::Network(_) => -113,
            ChuanError::Http(code) => -(*code as i32),
            ChuanError::PoisonedData(_) => -114,
            ChuanError::Cache(_) => -115,
            ChuanError::Internal(_) => -116,
        }
    }
}

/// Chuan 引擎统一 Result 类型
pub type ChuanResult<T> = Result<T, ChuanError>;
