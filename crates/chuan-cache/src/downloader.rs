//! 范围下载抽象与 HTTP 实现.
//!
//! `Downloader` 是传输层的能力边界: 引擎核心只依赖这一组调用,
//! 具体传输 (本实现为 `ureq`, 置于 `http` feature 之后) 可替换,
//! 测试用内存实现同样经由此 trait 注入.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use chuan_core::ChuanResult;
use chuan_core::event::Event;

/// 一次范围下载的参数快照
#[derive(Debug, Clone)]
pub struct RangeSpec {
    pub url: String,
    /// 起始逻辑位置
    pub start: i64,
    /// 结束逻辑位置 (不含), 0 表示直到文件末尾
    pub end: i64,
    /// 写入序列号, 会话用其拒绝陈旧数据
    pub serial: i32,
}

/// 数据回写结果, 由接收方控制传输节奏
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 接收了前 n 字节
    Accepted(usize),
    /// 窗口已满, 暂停传输等待消费
    Pause,
    /// 停止本次传输 (序列号过期、目标达成或会话关闭)
    Stop,
}

/// 下载数据接收方
pub trait DataSink: Send + Sync {
    /// 回写一段网络数据
    fn write(&self, data: &[u8], serial: i32) -> WriteOutcome;

    /// 服务端报告的逻辑文件总大小
    fn on_file_size(&self, _total: i64) {}

    /// 一次范围传输结束 (正常走完或失败)
    fn finish(&self, _serial: i32, _result: ChuanResult<()>) {}

    /// 下载过程事件
    fn on_event(&self, _event: &Event) {}

    /// 速度采样
    fn on_speed(&self, _bytes: i64, _bytes_per_sec: i64, _timestamp_ms: i64) {}

    /// 宿主是否要求中断
    fn is_interrupted(&self) -> bool {
        false
    }
}

/// 传输状态, 原子量供任意线程查询
#[derive(Debug, Default)]
pub struct DownloadStatus {
    http_code: AtomicI32,
    download_size: AtomicI64,
    error_code: AtomicI32,
}

impl DownloadStatus {
    pub fn http_code(&self) -> i32 {
        self.http_code.load(Ordering::Relaxed)
    }

    pub fn set_http_code(&self, code: i32) {
        self.http_code.store(code, Ordering::Relaxed);
    }

    pub fn download_size(&self) -> i64 {
        self.download_size.load(Ordering::Relaxed)
    }

    pub fn add_download_size(&self, n: i64) {
        self.download_size.fetch_add(n, Ordering::Relaxed);
    }

    pub fn error_code(&self) -> i32 {
        self.error_code.load(Ordering::Relaxed)
    }

    pub fn set_error_code(&self, code: i32) {
        self.error_code.store(code, Ordering::Relaxed);
    }
}

/// 范围下载器能力边界
pub trait Downloader: Send + Sync {
    /// 执行一次范围下载, 数据经 `sink.write` 回写.
    ///
    /// 阻塞直到传输走完、被 `sink` 叫停或被 `abort`.
    /// 被中止不算错误, 返回 Ok.
    fn run_download(&self, spec: &RangeSpec, sink: &dyn DataSink) -> ChuanResult<()>;

    /// 暂停传输, `block` 为真时等待传输线程确认停驻 (至多约 1 秒)
    fn pause(&self, block: bool);

    /// 恢复被暂停的传输
    fn resume(&self);

    /// 永久中止, 之后的 `run_download` 立即返回
    fn abort(&self);

    /// 传输状态
    fn status(&self) -> Arc<DownloadStatus>;
}

#[cfg(feature = "http")]
pub use http_impl::HttpDownloader;

#[cfg(feature = "http")]
mod http_impl {
    use std::io::Read;
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    use log::{debug, info, warn};

    use chuan_core::event::{Event, HttpEvent, IoTraffic};
    use chuan_core::{ChuanError, ChuanResult};

    use super::{DataSink, DownloadStatus, Downloader, RangeSpec, WriteOutcome};
    use crate::options::DownloadOptions;

    const CHUNK_SIZE: usize = 32 * 1024;
    /// 速度采样间隔
    const SPEED_SAMPLE_MS: u64 = 500;

    #[derive(Default)]
    struct Ctrl {
        paused: bool,
        aborted: bool,
        /// 传输线程已停驻在暂停等待中
        parked: bool,
        in_transfer: bool,
    }

    /// 基于 ureq 的范围下载器
    pub struct HttpDownloader {
        options: Arc<DownloadOptions>,
        status: Arc<DownloadStatus>,
        ctrl: Mutex<Ctrl>,
        cond: Condvar,
    }

    impl HttpDownloader {
        pub fn new(options: Arc<DownloadOptions>) -> HttpDownloader {
            HttpDownloader {
                options,
                status: Arc::new(DownloadStatus::default()),
                ctrl: Mutex::new(Ctrl::default()),
                cond: Condvar::new(),
            }
        }

        fn build_agent(&self) -> ureq::Agent {
            let connect_timeout = Duration::from_micros(self.options.connect_timeout_us.max(0) as u64);
            let config = ureq::Agent::config_builder()
                .timeout_connect(Some(connect_timeout))
                .http_status_as_error(false)
                .build();
            ureq::Agent::new_with_config(config)
        }

        fn is_aborted(&self) -> bool {
            self.ctrl.lock().unwrap().aborted
        }

        /// 暂停时停驻, 返回 false 表示已被中止
        fn park_if_paused(&self) -> bool {
            let mut ctrl = self.ctrl.lock().unwrap();
            while ctrl.paused && !ctrl.aborted {
                ctrl.parked = true;
                self.cond.notify_all();
                let (next, _) = self
                    .cond
                    .wait_timeout(ctrl, Duration::from_millis(100))
                    .unwrap();
                ctrl = next;
            }
            ctrl.parked = false;
            !ctrl.aborted
        }

        /// 单次 HTTP 尝试, 返回本次新交付的字节数
        fn attempt(
            &self,
            spec: &RangeSpec,
            sink: &dyn DataSink,
            delivered: &mut i64,
        ) -> ChuanResult<()> {
            let offset = spec.start + *delivered;
            let range = if spec.end > 0 {
                format!("bytes={}-{}", offset, spec.end - 1)
            } else {
                format!("bytes={offset}-")
            };

            sink.on_event(&Event::WillHttpOpen(HttpEvent {
                url: spec.url.clone(),
                offset,
                ..HttpEvent::default()
            }));

            let agent = self.build_agent();
            let open_start = Instant::now();
            let mut request = agent
                .get(&spec.url)
                .header("Range", &range)
                .header("User-Agent", &self.options.user_agent);
            if !self.options.referer.is_empty() {
                request = request.header("Referer", &self.options.referer);
            }
            for header in &self.options.headers {
                if let Some((name, value)) = header.split_once(':') {
                    request = request.header(name.trim(), value.trim());
                }
            }

            let mut response = request
                .call()
                .map_err(|e| ChuanError::Network(format!("HTTP 请求失败: {e}")))?;

            let http_code = response.status().as_u16();
            self.status.set_http_code(http_code as i32);

            let file_size = total_size_of(&response, offset);
            sink.on_event(&Event::DidHttpOpen(HttpEvent {
                url: spec.url.clone(),
                offset,
                http_code: http_code as i32,
                file_size: file_size.unwrap_or(0),
                http_rtt: open_start.elapsed().as_millis() as i32,
                ..HttpEvent::default()
            }));

            if http_code >= 400 {
                return Err(ChuanError::Http(http_code));
            }
            if let Some(total) = file_size {
                sink.on_file_size(total);
            }

            let mut reader = response.body_mut().as_reader();
            let mut buf = [0u8; CHUNK_SIZE];
            let mut sample_bytes: i64 = 0;
            let mut sample_start = Instant::now();

            loop {
                if !self.park_if_paused() || sink.is_interrupted() {
                    debug!("范围下载被中止: {}", spec.url);
                    return Ok(());
                }
                let n = reader
                    .read(&mut buf)
                    .map_err(|e| ChuanError::Network(format!("网络读取错误: {e}")))?;
                if n == 0 {
                    info!("范围下载完成: {} 共 {} 字节", spec.url, *delivered);
                    return Ok(());
                }

                let mut written = 0;
                while written < n {
                    match sink.write(&buf[written..n], spec.serial) {
                        WriteOutcome::Accepted(m) => {
                            written += m;
                            *delivered += m as i64;
                            sample_bytes += m as i64;
                            self.status.add_download_size(m as i64);
                        }
                        WriteOutcome::Pause => {
                            let mut ctrl = self.ctrl.lock().unwrap();
                            if ctrl.aborted {
                                return Ok(());
                            }
                            let (next, _) = self
                                .cond
                                .wait_timeout(ctrl, Duration::from_millis(100))
                                .unwrap();
                            ctrl = next;
                            drop(ctrl);
                        }
                        WriteOutcome::Stop => return Ok(()),
                    }
                }

                let elapsed = sample_start.elapsed();
                if elapsed.as_millis() as u64 >= SPEED_SAMPLE_MS {
                    let bps = sample_bytes * 1000 / elapsed.as_millis().max(1) as i64;
                    let now_ms = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis() as i64)
                        .unwrap_or(0);
                    sink.on_speed(*delivered, bps, now_ms);
                    sink.on_event(&Event::IoTraffic(IoTraffic {
                        url: spec.url.clone(),
                        bytes: *delivered,
                        ..IoTraffic::default()
                    }));
                    sample_bytes = 0;
                    sample_start = Instant::now();
                }
            }
        }
    }

    /// 从响应头推断逻辑文件总大小.
    ///
    /// Content-Range 的总长度优先, 否则 Content-Length 加上请求偏移.
    fn total_size_of(response: &ureq::http::Response<ureq::Body>, offset: i64) -> Option<i64> {
        if let Some(total) = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit_once('/'))
            .and_then(|(_, total)| total.parse::<i64>().ok())
        {
            return Some(total);
        }
        response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .map(|len| len + offset)
    }

    impl Downloader for HttpDownloader {
        fn run_download(&self, spec: &RangeSpec, sink: &dyn DataSink) -> ChuanResult<()> {
            {
                let mut ctrl = self.ctrl.lock().unwrap();
                if ctrl.aborted {
                    return Ok(());
                }
                ctrl.in_transfer = true;
            }
            let mut delivered: i64 = 0;
            let mut result = Ok(());
            for attempt in 0..=self.options.max_retry {
                if self.is_aborted() || sink.is_interrupted() {
                    result = Ok(());
                    break;
                }
                match self.attempt(spec, sink, &mut delivered) {
                    Ok(()) => {
                        result = Ok(());
                        break;
                    }
                    Err(e) => {
                        let retryable = match &e {
                            ChuanError::Http(code) => *code >= 500,
                            ChuanError::Network(_)
                            | ChuanError::ConnectTimeout
                            | ChuanError::DnsResolve(_) => true,
                            _ => false,
                        };
                        self.status.set_error_code(e.code());
                        if !retryable || attempt == self.options.max_retry {
                            warn!("范围下载失败: {} ({e})", spec.url);
                            result = Err(e);
                            break;
                        }
                        debug!("范围下载第 {} 次重试: {} ({e})", attempt + 1, spec.url);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            let mut ctrl = self.ctrl.lock().unwrap();
            ctrl.in_transfer = false;
            self.cond.notify_all();
            result
        }

        fn pause(&self, block: bool) {
            let mut ctrl = self.ctrl.lock().unwrap();
            ctrl.paused = true;
            self.cond.notify_all();
            if block {
                let deadline = Instant::now() + Duration::from_secs(1);
                while ctrl.in_transfer && !ctrl.parked && !ctrl.aborted {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (next, _) = self.cond.wait_timeout(ctrl, deadline - now).unwrap();
                    ctrl = next;
                }
            }
        }

        fn resume(&self) {
            let mut ctrl = self.ctrl.lock().unwrap();
            ctrl.paused = false;
            self.cond.notify_all();
        }

        fn abort(&self) {
            let mut ctrl = self.ctrl.lock().unwrap();
            ctrl.aborted = true;
            self.cond.notify_all();
        }

        fn status(&self) -> Arc<DownloadStatus> {
            self.status.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_shared_and_atomic() {
        let status = DownloadStatus::default();
        status.set_http_code(206);
        status.add_download_size(100);
        status.add_download_size(50);
        status.set_error_code(-110);
        assert_eq!(status.http_code(), 206);
        assert_eq!(status.download_size(), 150);
        assert_eq!(status.error_code(), -110);
    }
}
