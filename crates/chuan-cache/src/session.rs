//! 下载会话: 内存窗口 + 磁盘缓存的阻塞读取门面.
//!
//! 一个会话对应一个资源 URL. 内存里只保留一个下载分片宽度的
//! 滑动窗口 (外加少量余量), 读取指针越过窗口边界时当前窗口落盘、
//! 窗口滑到新位置并重新下发下载范围. 每次"带下载的重建窗口"都会
//! 递增序列号, 旧范围迟到的数据按序列号拒收, 窗口内容不被污染.
//!
//! 阻塞读取以 1 秒为观察窗: 窗口内无进展累计超过 `retry_count`
//! 个观察窗判超时; 有进展或未超限时向调用方返回"稍后重试",
//! 由上层读取循环驱动. 传输失败时依次切换 URL 备选列表.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use chuan_core::event::{
    CacheStatistic, ErrorEvent, Event, EventListener, FragmentInfo, UrlChange,
};
use chuan_core::{ChuanError, ChuanResult, url};

use crate::context::EngineContext;
use crate::downloader::{DataSink, RangeSpec, WriteOutcome};
use crate::options::DownloadOptions;
use crate::store::SegmentStore;
use crate::task::DownloadTask;
use crate::token::TokenInfo;

/// seek 的 whence 魔数: 不移动指针, 只查询逻辑文件大小
pub const SEEK_SIZE: i32 = 0x10000;

/// 读取无进展的观察窗宽度
const STALL_WINDOW: Duration = Duration::from_secs(1);

/// 等待切片, 兼顾中断回调的响应速度
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// 污染嗅探只看窗口尾部这么多字节
const SNIFF_LIMIT: usize = 10 * 1024;

static NEXT_SESSION_ID: AtomicI64 = AtomicI64::new(1);

#[derive(Default)]
struct SessionState {
    /// open 传入的原始 URL
    opened_url: String,
    /// 当前实际使用的下载地址
    real_url: String,
    /// 备选地址, 换源时依次取用
    url_list: Vec<String>,
    cache_key: String,
    store: Option<Arc<SegmentStore>>,
    /// 缓存条目已被本会话引用 (open 对应一次 close)
    store_pinned: bool,
    /// 窗口缓冲: range_size + 余量
    buffer: Option<Vec<u8>>,
    /// 窗口起点 (逻辑位置, 按 range_size 对齐)
    window_start: i64,
    /// 窗口内读指针
    read_pos: usize,
    /// 窗口内写指针, 之前的字节有效
    write_pos: usize,
    /// 对外暴露的读取逻辑位置
    logical_pos: i64,
    /// 逻辑文件总大小, 0 表示未知
    file_size: i64,
    /// 写入序列号, 带下载的窗口重建递增
    serial: i32,
    /// 窗口内容有效 (落盘后置 false)
    loaded: bool,
    /// 本窗口内来自网络的字节数, 落盘前做错误页嗅探
    net_bytes: usize,
    /// 新范围下发后的首次落盘 (嗅探只做这一次)
    first_flush: bool,
    /// 预载目标字节数, 0 表示非预载
    preload_target: i64,
    preload_finished: bool,
    paused: bool,
    abort: bool,
    closed: bool,
    /// 下载侧最近一次报告的错误码, 0 表示无
    last_error: i32,
    /// 连续无进展的观察窗计数
    stall_count: u32,
    is_live: bool,
    token: Option<TokenInfo>,
    /// token 密文累积区, 攒满后整体解密
    token_buf: Vec<u8>,
    token_done: bool,
    /// 解密产出、尚未入窗的明文
    pending_plain: Vec<u8>,
}

/// 下载会话
pub struct CacheSession {
    id: i64,
    ctx: Arc<EngineContext>,
    options: Arc<DownloadOptions>,
    listener: Arc<dyn EventListener>,
    state: Mutex<SessionState>,
    cond: Condvar,
    task: Mutex<Option<Arc<DownloadTask>>>,
    self_weak: Weak<CacheSession>,
}

impl CacheSession {
    pub fn new(
        ctx: Arc<EngineContext>,
        options: Arc<DownloadOptions>,
        listener: Arc<dyn EventListener>,
    ) -> Arc<CacheSession> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|weak| CacheSession {
            id,
            ctx,
            options,
            listener,
            state: Mutex::new(SessionState::default()),
            cond: Condvar::new(),
            task: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    /// 打开资源: 解析地址列表、引用磁盘缓存、分配窗口.
    ///
    /// 携带预载目标 (或广告类型) 时立即发起预载. 返回会话 id.
    pub fn open(&self, open_url: &str) -> ChuanResult<i64> {
        let mut st = self.state.lock().unwrap();
        if st.closed {
            return Err(ChuanError::InvalidArgument("会话已关闭".to_string()));
        }
        st.opened_url = open_url.to_string();

        let mut target_url = open_url.to_string();
        if self.options.use_https {
            target_url = target_url.replace("http://", "https://");
        }
        let mut list = url::split_url_list(&target_url, &self.options.url_list_separator);
        if list.is_empty() {
            return Err(ChuanError::InvalidArgument("URL 列表为空".to_string()));
        }
        if self.options.use_https {
            // https 备选全部失败后还能降级重试
            let downgraded: Vec<String> = list
                .iter()
                .map(|u| u.replace("https://", "http://"))
                .collect();
            list.extend(downgraded);
        }
        st.real_url = list.remove(0);
        st.url_list = list;
        st.is_live = self.options.is_live || st.real_url.contains(".flv");
        st.cache_key = url::cache_key_of(&st.real_url);
        if st.cache_key.is_empty() {
            return Err(ChuanError::InvalidArgument(format!(
                "无法从 {} 推导缓存键",
                st.real_url
            )));
        }

        if !self.options.token.is_empty() {
            match TokenInfo::parse(&self.options.token) {
                Ok(tok) if tok.is_active() => st.token = Some(tok),
                Ok(_) => {}
                Err(e) => warn!("会话 {} token 解析失败: {e}", self.id),
            }
        }

        if self.use_store() && !st.is_live {
            let store = self.ctx.stores.set_dir_capacity(
                &self.options.cache_dir,
                self.options.cache_max_entries as usize,
                self.options.cache_max_capacity,
            )?;
            store.open_cache_file(&st.cache_key)?;
            if let Some((size, _)) = store.get_file_size(&st.cache_key) {
                if size > 0 {
                    st.file_size = size;
                }
            }
            st.store_pinned = true;
            st.store = Some(store);
        }

        let buf_len = self.ctx.config.range_size + self.ctx.config.clamped_extra_size();
        st.buffer = Some(vec![0u8; buf_len]);

        let cached = cached_size(&st);
        let stat = CacheStatistic {
            cached_size: cached,
            logical_file_size: st.file_size,
        };
        info!(
            "会话 {} 打开: {} (缓存键 {}, 已缓存 {} 字节)",
            self.id, st.real_url, st.cache_key, cached
        );
        drop(st);
        self.listener.on_event(&Event::CacheStatistic(stat));

        if self.options.preload_bytes > 0 || self.options.download_type.is_ads() {
            self.preload(self.options.preload_bytes);
        }
        Ok(self.id)
    }

    /// 发起预载: 把文件头部 `bytes` 字节灌进磁盘缓存.
    ///
    /// 目标已被缓存覆盖时直接上报分片完成, 不下发任务.
    pub fn preload(&self, bytes: i64) {
        let mut st = self.state.lock().unwrap();
        if st.abort || st.closed || st.preload_finished {
            return;
        }
        let range = self.ctx.config.range_size as i64;
        let mut target = if bytes > 0 { bytes } else { range };
        if st.file_size > 0 {
            target = target.min(st.file_size);
        }
        let cached = cached_size(&st);
        if cached >= target {
            st.preload_finished = true;
            let event = Event::FragmentComplete(FragmentInfo {
                url: st.real_url.clone(),
                bytes: cached,
            });
            drop(st);
            self.listener.on_event(&event);
            return;
        }

        st.preload_target = target;
        let start = (cached / range) * range;
        if let Err(e) = self.load_window(&mut st, start, true) {
            warn!("会话 {} 预载启动失败: {e}", self.id);
            return;
        }
        // 窗口从缓存填充后可能已经覆盖目标
        if st.window_start + st.write_pos as i64 >= target {
            let event = self.finish_preload(&mut st);
            drop(st);
            if let Some(event) = event {
                self.listener.on_event(&event);
            }
        }
    }

    /// 阻塞读取, 无数据时最多等一个观察窗.
    ///
    /// `Err(Again)` 是重试信号 (尚无数据 / 刚换源), 上层读取循环
    /// 应重新调用; `Err(Eof)` 表示逻辑位置已到文件尾.
    pub fn read(&self, buf: &mut [u8]) -> ChuanResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.read_attempt(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.map_read_error(e)),
        }
    }

    /// 移动读取位置.
    ///
    /// 直播流不可定位; `whence = SEEK_SIZE` 只查询文件大小.
    /// 目标在当前窗口内时 O(1) 改指针, 否则当前窗口落盘、
    /// 从新位置重建窗口并重新下发下载范围.
    pub fn seek(&self, offset: i64, whence: i32) -> ChuanResult<i64> {
        let mut st = self.state.lock().unwrap();
        if whence == SEEK_SIZE {
            return if st.file_size > 0 {
                Ok(st.file_size)
            } else {
                Err(ChuanError::Unsupported("文件大小未知".to_string()))
            };
        }
        if st.is_live {
            return Err(ChuanError::Unsupported("直播流不可定位".to_string()));
        }
        let pos = match whence {
            0 => offset,
            1 => st.logical_pos + offset,
            2 if st.file_size > 0 => st.file_size + offset,
            _ => {
                return Err(ChuanError::InvalidArgument(format!(
                    "不支持的 whence {whence}"
                )));
            }
        };
        if pos < 0 {
            return Err(ChuanError::InvalidArgument(format!("负的目标位置 {pos}")));
        }
        if pos == st.logical_pos {
            return Ok(pos);
        }

        let range = self.ctx.config.range_size as i64;
        if st.loaded && pos >= st.window_start && pos < st.window_start + range {
            st.logical_pos = pos;
            st.read_pos = (pos - st.window_start) as usize;
            debug!("会话 {} 窗口内定位到 {pos}", self.id);
            return Ok(pos);
        }

        // 窗口外: 先停当前范围再落盘重建, 避免旧数据混入新窗口
        drop(st);
        {
            let task = self.task.lock().unwrap();
            if let Some(task) = task.as_ref() {
                task.flush();
            }
        }
        let mut st = self.state.lock().unwrap();
        self.flush_to_store(&mut st);
        st.logical_pos = pos;
        self.load_window(&mut st, pos, true)?;
        debug!("会话 {} 跨窗口定位到 {pos}", self.id);
        Ok(pos)
    }

    /// 暂停会话: 窗口保留, 传输停驻, 可由 `resume` 恢复
    pub fn pause(&self) {
        let mut st = self.state.lock().unwrap();
        st.paused = true;
        drop(st);
        let task = self.task.lock().unwrap();
        if let Some(task) = task.as_ref() {
            task.pause(false);
        }
    }

    /// 停住传输但保留窗口与缓存引用, 可由 `resume` 续跑.
    ///
    /// 与 `pause` 的区别: 等待传输线程确认停驻后才返回.
    pub fn stop(&self) {
        let mut st = self.state.lock().unwrap();
        st.paused = true;
        drop(st);
        let task = self.task.lock().unwrap();
        if let Some(task) = task.as_ref() {
            task.pause(true);
        }
    }

    /// 恢复被暂停的会话
    pub fn resume(&self) {
        let mut st = self.state.lock().unwrap();
        st.paused = false;
        drop(st);
        let task = self.task.lock().unwrap();
        if let Some(task) = task.as_ref() {
            task.resume();
        }
        self.cond.notify_all();
    }

    /// 把尚未开跑的预载任务提到队首
    pub fn update_preload_priority(&self) {
        let st = self.state.lock().unwrap();
        if st.preload_finished {
            return;
        }
        drop(st);
        let task = self.task.lock().unwrap();
        if let Some(task) = task.as_ref() {
            self.ctx.pool.move_task_to_head(task);
        }
    }

    /// 关闭会话: 停任务、窗口落盘、解除缓存引用、释放窗口. 幂等.
    pub fn close(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            st.abort = true;
            self.cond.notify_all();
        }
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task.as_ref() {
            task.stop();
            self.ctx.pool.delete_task(task);
        }

        let mut st = self.state.lock().unwrap();
        self.flush_to_store(&mut st);
        if st.store_pinned {
            if let Some(store) = st.store.clone() {
                if st.file_size > 0 {
                    store.set_file_size(&st.cache_key, st.file_size);
                }
                store.close_cache_file(&st.cache_key);
            }
            st.store_pinned = false;
        }
        st.buffer = None;
        let url = st.real_url.clone();
        drop(st);
        info!("会话 {} 关闭: {url}", self.id);
        self.listener.on_event(&Event::Release);
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// open 传入的原始 URL
    pub fn opened_url(&self) -> String {
        self.state.lock().unwrap().opened_url.clone()
    }

    pub fn cache_key(&self) -> String {
        self.state.lock().unwrap().cache_key.clone()
    }

    pub fn options(&self) -> &Arc<DownloadOptions> {
        &self.options
    }

    pub fn is_preload_finished(&self) -> bool {
        self.state.lock().unwrap().preload_finished
    }

    pub fn file_size(&self) -> i64 {
        self.state.lock().unwrap().file_size
    }

    /// 该资源已落盘的字节数
    pub fn get_cache_size(&self) -> i64 {
        let st = self.state.lock().unwrap();
        cached_size(&st)
    }

    fn use_store(&self) -> bool {
        self.options.load_from_file && !self.options.cache_dir.is_empty()
    }

    fn read_attempt(&self, buf: &mut [u8]) -> ChuanResult<usize> {
        let range = self.ctx.config.range_size;
        let mut st = self.state.lock().unwrap();
        if st.closed {
            return Err(ChuanError::InvalidArgument("会话已关闭".to_string()));
        }

        loop {
            if st.abort {
                return Err(ChuanError::Again);
            }
            if st.file_size > 0 && st.logical_pos >= st.file_size {
                self.flush_to_store(&mut st);
                return Err(ChuanError::Eof);
            }
            if st.buffer.is_none() {
                // 预载结束后继续按播放逻辑读取: 重新分配窗口
                st.buffer = Some(vec![0u8; range + self.ctx.config.clamped_extra_size()]);
                st.preload_target = 0;
                st.loaded = false;
            }
            if !st.loaded {
                let pos = st.logical_pos;
                self.load_window(&mut st, pos, true)?;
            }

            let offset = st.logical_pos - st.window_start;
            if offset < 0 || offset >= range as i64 {
                if self.options.read_async {
                    self.flush_to_store(&mut st);
                    let pos = st.logical_pos;
                    self.load_window(&mut st, pos, true)?;
                } else {
                    self.roll_window_sync(&mut st)?;
                }
                continue;
            }
            st.read_pos = offset as usize;

            // 等窗口里出现可读字节, 一个观察窗内无进展则交还调用方
            let deadline = Instant::now() + STALL_WINDOW;
            let wpos_at_entry = st.write_pos;
            while st.write_pos <= st.read_pos {
                if st.abort || st.closed {
                    return Err(ChuanError::Again);
                }
                if self.listener.is_interrupted() {
                    return Err(ChuanError::Again);
                }
                if st.file_size > 0 && st.logical_pos >= st.file_size {
                    return Err(ChuanError::Eof);
                }
                if st.last_error != 0 {
                    let code = st.last_error;
                    st.last_error = 0;
                    return Err(error_from_code(code));
                }
                let now = Instant::now();
                if now >= deadline {
                    if st.write_pos != wpos_at_entry {
                        st.stall_count = 0;
                        return Err(ChuanError::Again);
                    }
                    st.stall_count += 1;
                    if st.stall_count > self.ctx.config.retry_count {
                        return Err(ChuanError::Timeout);
                    }
                    return Err(ChuanError::Again);
                }
                let (next, _) = self
                    .cond
                    .wait_timeout(st, WAIT_SLICE.min(deadline - now))
                    .unwrap();
                st = next;
            }

            // 错误页在交付前拦截: 首次落盘完成前每次读都嗅探窗口尾部,
            // 命中则回退写指针, 污染字节不出窗口
            if self.poisoned_tail(&st) {
                warn!(
                    "会话 {} 窗口数据疑似错误页, 丢弃 {} 字节",
                    self.id, st.net_bytes
                );
                self.drop_net_bytes(&mut st);
                return Err(ChuanError::PoisonedData(
                    "服务端返回疑似错误页".to_string(),
                ));
            }

            let mut want = buf.len().min(st.write_pos - st.read_pos);
            if st.file_size > 0 {
                want = want.min((st.file_size - st.logical_pos) as usize);
            }
            if want == 0 {
                continue;
            }
            st.stall_count = 0;
            let rp = st.read_pos;
            if let Some(buffer) = st.buffer.as_ref() {
                buf[..want].copy_from_slice(&buffer[rp..rp + want]);
            }
            st.read_pos += want;
            st.logical_pos += want as i64;
            return Ok(want);
        }
    }

    /// 读取失败的善后: 停范围、落盘 (含污染检查)、换源.
    ///
    /// 有备选地址时换源并把错误弱化为重试信号; 超时在已有进展时
    /// 同样弱化, 颗粒无收则升级为建连超时.
    fn map_read_error(&self, err: ChuanError) -> ChuanError {
        if err.is_again() || err.is_eof() {
            return err;
        }
        {
            let st = self.state.lock().unwrap();
            if !st.loaded {
                return err;
            }
        }
        {
            let task = self.task.lock().unwrap();
            if let Some(task) = task.as_ref() {
                task.flush();
            }
        }

        let mut st = self.state.lock().unwrap();
        st.preload_target = 0;
        self.flush_to_store(&mut st);
        st.last_error = 0;
        st.stall_count = 0;

        let status = {
            let task = self.task.lock().unwrap();
            task.as_ref().map(|t| t.status())
        };

        if !st.url_list.is_empty() {
            let next = st.url_list.remove(0);
            let change = UrlChange {
                current_url: st.real_url.clone(),
                http_code: status.as_ref().map(|s| s.http_code()).unwrap_or(0),
                next_url: next.clone(),
            };
            warn!(
                "会话 {} 换源: {} -> {next} ({err})",
                self.id, change.current_url
            );
            st.real_url = next;
            drop(st);
            self.listener.on_event(&Event::UrlChange(change));
            return ChuanError::Again;
        }

        let final_err = if matches!(err, ChuanError::Timeout) {
            let downloaded = status.map(|s| s.download_size()).unwrap_or(0);
            if downloaded > 0 {
                return ChuanError::Again;
            }
            ChuanError::ConnectTimeout
        } else {
            err
        };
        let event = Event::Error(ErrorEvent {
            url: st.real_url.clone(),
            error: final_err.code(),
        });
        drop(st);
        self.listener.on_event(&event);
        final_err
    }

    /// 把窗口滑到覆盖 `pos` 的位置: 先用磁盘缓存填充,
    /// `need_download` 时递增序列号并 (必要时) 下发新范围.
    fn load_window(&self, st: &mut SessionState, pos: i64, need_download: bool) -> ChuanResult<()> {
        let range = self.ctx.config.range_size;
        if st.buffer.is_none() {
            st.buffer = Some(vec![0u8; range + self.ctx.config.clamped_extra_size()]);
        }
        if st.preload_finished {
            st.preload_target = 0;
        }
        let window_start = (pos / range as i64) * range as i64;
        st.window_start = window_start;
        st.read_pos = (pos - window_start) as usize;
        st.write_pos = 0;
        st.net_bytes = 0;
        st.loaded = true;

        let mut filled = 0usize;
        if !st.is_live {
            if let Some(store) = st.store.clone() {
                let period = store
                    .get_file_size(&st.cache_key)
                    .map(|(_, p)| p as usize)
                    .unwrap_or(range)
                    .max(1);
                if let Some(buffer) = st.buffer.as_mut() {
                    while filled < range {
                        let chunk = period.min(range - filled);
                        let n = store.get_cache_file(
                            &st.cache_key,
                            window_start as u64 + filled as u64,
                            &mut buffer[filled..filled + chunk],
                        );
                        filled += n;
                        if n < chunk {
                            break;
                        }
                    }
                }
            }
        }
        st.write_pos = filled;

        if need_download {
            st.serial += 1;
            self.dispatch(st);
        }
        Ok(())
    }

    /// 以当前序列号与窗口位置下发 (或更新) 下载范围.
    ///
    /// 范围已被窗口内容覆盖时不下发. 预载任务重新入池排队,
    /// 前台任务经 `update_param` 在专属线程上续跑.
    fn dispatch(&self, st: &mut SessionState) {
        let range = self.ctx.config.range_size as i64;
        let start = st.window_start + st.write_pos as i64;
        let spec = if st.is_live {
            RangeSpec {
                url: st.real_url.clone(),
                start: 0,
                end: 0,
                serial: st.serial,
            }
        } else {
            let mut end = if st.preload_target > 0 && !st.preload_finished {
                st.preload_target
            } else {
                st.window_start + range
            };
            if st.file_size > 0 {
                end = end.min(st.file_size);
            }
            RangeSpec {
                url: st.real_url.clone(),
                start,
                end,
                serial: st.serial,
            }
        };
        if !st.is_live && spec.end > 0 && spec.start >= spec.end {
            return;
        }
        st.first_flush = true;
        st.last_error = 0;
        debug!(
            "会话 {} 下发范围 [{}, {}) serial {}",
            self.id, spec.start, spec.end, spec.serial
        );

        let is_prefetch = self.options.download_type.is_prefetch();
        let mut task_slot = self.task.lock().unwrap();
        match task_slot.as_ref() {
            Some(task) if is_prefetch => {
                // 池工作线程对每次入队只跑一轮, 重新下发即重新入队
                let weak: Weak<dyn DataSink> = self.self_weak.clone();
                task.set_parameter(spec, weak);
                self.ctx.pool.add_task(task.clone(), true);
            }
            Some(task) => task.update_param(spec),
            None => {
                let downloader = (self.ctx.downloader_factory)(self.options.clone());
                let task = DownloadTask::new(downloader);
                let weak: Weak<dyn DataSink> = self.self_weak.clone();
                task.set_parameter(spec, weak);
                self.ctx.pool.add_task(task.clone(), is_prefetch);
                *task_slot = Some(task);
            }
        }
    }

    /// 同步读取模式的窗口推进: 窗口余量里已下载的字节搬到新窗口
    /// 开头继续用, 磁盘缓存更靠前时改用缓存并重新下发范围.
    fn roll_window_sync(&self, st: &mut SessionState) -> ChuanResult<()> {
        let range = self.ctx.config.range_size;
        let forward = st.logical_pos == st.window_start + range as i64;
        let extra_cap = self.ctx.config.clamped_extra_size();
        let extra_len = if forward {
            st.write_pos.saturating_sub(range).min(extra_cap)
        } else {
            0
        };
        let carried: Vec<u8> = if extra_len > 0 {
            st.buffer
                .as_ref()
                .map(|b| b[range..range + extra_len].to_vec())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        self.flush_to_store(st);
        if carried.is_empty() {
            self.load_window(st, st.logical_pos, true)?;
            return Ok(());
        }

        self.load_window(st, st.logical_pos, false)?;
        if st.write_pos > carried.len() {
            // 缓存比窗口余量更靠前, 丢弃余量改用缓存
            st.serial += 1;
            self.dispatch(st);
        } else {
            // 余量续接: 网络流位置与新写指针严丝合缝, 序列号不变
            if let Some(buffer) = st.buffer.as_mut() {
                buffer[..carried.len()].copy_from_slice(&carried);
            }
            st.write_pos = carried.len();
        }
        Ok(())
    }

    /// 窗口内容落盘.
    ///
    /// 新范围的首次落盘先嗅探窗口尾部的网络字节: 命中错误页特征
    /// 或 HTTP 状态 >= 400 时丢弃网络字节且不落盘, 避免 CDN 挂壁
    /// 页污染缓存.
    fn flush_to_store(&self, st: &mut SessionState) {
        if !st.loaded {
            return;
        }
        st.loaded = false;

        let http_code = {
            let task = self.task.lock().unwrap();
            task.as_ref().map(|t| t.status().http_code()).unwrap_or(0)
        };

        let poisoned = self.poisoned_tail(st);
        st.first_flush = false;

        if poisoned || http_code >= 400 {
            warn!(
                "会话 {} 窗口数据疑似错误页 (http {http_code}), 丢弃 {} 字节",
                self.id, st.net_bytes
            );
            self.drop_net_bytes(st);
            return;
        }
        st.net_bytes = 0;

        if st.is_live || st.write_pos == 0 {
            return;
        }
        let Some(store) = st.store.clone() else {
            return;
        };
        let period = store
            .get_file_size(&st.cache_key)
            .map(|(_, p)| p as usize)
            .unwrap_or(self.ctx.config.range_size)
            .max(1);
        if let Some(buffer) = st.buffer.as_ref() {
            let total = st.write_pos.min(buffer.len());
            let mut off = 0usize;
            while off < total {
                let chunk = period.min(total - off);
                if let Err(e) = store.update_cache_info(
                    &st.cache_key,
                    st.window_start as u64 + off as u64,
                    &buffer[off..off + chunk],
                ) {
                    warn!("会话 {} 缓存分段落盘失败: {e}", self.id);
                    break;
                }
                off += chunk;
            }
        }
        if st.file_size > 0 {
            store.set_file_size(&st.cache_key, st.file_size);
        }
    }

    /// 新范围首次落盘前的污染嗅探: 窗口尾部的网络字节像错误页即命中
    fn poisoned_tail(&self, st: &SessionState) -> bool {
        if !st.first_flush || st.net_bytes == 0 {
            return false;
        }
        match st.buffer.as_ref() {
            Some(buffer) => {
                let end = st.write_pos.min(buffer.len());
                let sniff = st.net_bytes.min(SNIFF_LIMIT).min(end);
                looks_like_error_page(&buffer[end - sniff..end])
            }
            None => false,
        }
    }

    /// 丢弃窗口里来自网络的字节, 写指针回退到入窗前的位置
    fn drop_net_bytes(&self, st: &mut SessionState) {
        st.write_pos = st.write_pos.saturating_sub(st.net_bytes);
        let wpos = st.write_pos;
        if let Some(buffer) = st.buffer.as_mut() {
            buffer[wpos..].fill(0);
        }
        st.net_bytes = 0;
    }

    /// 预载收尾: 落盘、解除缓存引用、释放窗口, 返回待上报事件
    fn finish_preload(&self, st: &mut SessionState) -> Option<Event> {
        if st.preload_finished {
            return None;
        }
        self.flush_to_store(st);
        st.preload_finished = true;
        let mut bytes = 0;
        if let Some(store) = st.store.clone() {
            if st.file_size > 0 {
                store.set_file_size(&st.cache_key, st.file_size);
            }
            bytes = store.get_cache_size(&st.cache_key);
            if st.store_pinned {
                store.close_cache_file(&st.cache_key);
                st.store_pinned = false;
            }
        }
        st.buffer = None;
        self.cond.notify_all();
        info!(
            "会话 {} 预载完成: {} 已缓存 {bytes} 字节",
            self.id, st.real_url
        );
        Some(Event::FragmentComplete(FragmentInfo {
            url: st.real_url.clone(),
            bytes,
        }))
    }

    /// 网络数据入窗, 返回消费的字节数, 0 表示窗口已满.
    ///
    /// 预载顺序推进时当前窗口落盘后直接滑到下一窗口继续收;
    /// 同步读取模式允许写进窗口余量.
    fn accept_into_window(&self, st: &mut SessionState, data: &[u8]) -> usize {
        let range = self.ctx.config.range_size;
        loop {
            let preload_active = st.preload_target > 0 && !st.preload_finished;
            let sync_extra = !self.options.read_async && !preload_active;
            let mut cap = if sync_extra {
                range + self.ctx.config.clamped_extra_size()
            } else {
                range
            };
            cap = cap.min(st.buffer.as_ref().map(|b| b.len()).unwrap_or(0));

            if st.write_pos < cap {
                let n = data.len().min(cap - st.write_pos);
                let wpos = st.write_pos;
                match st.buffer.as_mut() {
                    Some(buffer) => buffer[wpos..wpos + n].copy_from_slice(&data[..n]),
                    None => return 0,
                }
                st.write_pos += n;
                st.net_bytes += n;
                return n;
            }
            if preload_active && st.write_pos >= range {
                self.flush_to_store(st);
                let next = st.window_start + range as i64;
                if self.load_window(st, next, false).is_err() {
                    return 0;
                }
                continue;
            }
            return 0;
        }
    }
}

impl DataSink for CacheSession {
    fn write(&self, data: &[u8], serial: i32) -> WriteOutcome {
        let mut st = self.state.lock().unwrap();
        if st.abort || st.closed {
            return WriteOutcome::Stop;
        }
        if serial != st.serial {
            debug!(
                "会话 {} 拒收过期数据: serial {serial} != {}",
                self.id, st.serial
            );
            return WriteOutcome::Stop;
        }
        if st.preload_target > 0 && st.preload_finished {
            return WriteOutcome::Stop;
        }
        if st.paused {
            return WriteOutcome::Pause;
        }
        if !st.loaded || st.buffer.is_none() {
            return WriteOutcome::Stop;
        }

        // 解密遗留的明文先入窗
        while !st.pending_plain.is_empty() {
            let pending = std::mem::take(&mut st.pending_plain);
            let n = self.accept_into_window(&mut st, &pending);
            if n < pending.len() {
                st.pending_plain = pending[n..].to_vec();
                self.cond.notify_all();
                return WriteOutcome::Pause;
            }
        }

        // token 加密区间: 密文攒满后整体解密再入窗
        if let Some(tok) = st.token.clone() {
            if !st.token_done {
                let abs = st.window_start + st.write_pos as i64;
                let enc_start = tok.range_start as i64;
                let enc_end = enc_start + tok.encrypted_len() as i64;
                if abs >= enc_start && abs < enc_end {
                    let need = tok.encrypted_len() as usize - st.token_buf.len();
                    let take = need.min(data.len());
                    st.token_buf.extend_from_slice(&data[..take]);
                    if st.token_buf.len() == tok.encrypted_len() as usize {
                        let mut plain = std::mem::take(&mut st.token_buf);
                        if let Err(e) = tok.decrypt(&mut plain) {
                            warn!("会话 {} token 区间解密失败: {e}", self.id);
                        }
                        st.token_done = true;
                        let n = self.accept_into_window(&mut st, &plain);
                        if n < plain.len() {
                            st.pending_plain = plain[n..].to_vec();
                        }
                    }
                    self.cond.notify_all();
                    return WriteOutcome::Accepted(take);
                }
                // 加密区间尚在写入点下游时保持待命, 越过尾部才解除
                if abs >= enc_end {
                    st.token_done = true;
                }
            }
        }

        let n = self.accept_into_window(&mut st, data);
        if n == 0 {
            return WriteOutcome::Pause;
        }

        // 预载目标达成: 落盘收尾并叫停传输
        let downloaded = st.window_start + st.write_pos as i64;
        if st.preload_target > 0
            && !st.preload_finished
            && (downloaded >= st.preload_target
                || (st.file_size > 0 && downloaded >= st.file_size))
        {
            let event = self.finish_preload(&mut st);
            drop(st);
            if let Some(event) = event {
                self.listener.on_event(&event);
            }
            return WriteOutcome::Stop;
        }

        self.cond.notify_all();
        WriteOutcome::Accepted(n)
    }

    fn on_file_size(&self, total: i64) {
        let mut st = self.state.lock().unwrap();
        if total > 0 && st.file_size != total {
            st.file_size = total;
            if let Some(store) = st.store.clone() {
                store.set_file_size(&st.cache_key, total);
            }
            self.cond.notify_all();
        }
    }

    fn finish(&self, serial: i32, result: ChuanResult<()>) {
        let mut st = self.state.lock().unwrap();
        if serial != st.serial {
            return;
        }
        let mut event = None;
        match result {
            Ok(()) => {
                // 范围走完即视为预载交付完毕 (HTTP 错误走 Err 分支)
                if st.preload_target > 0 && !st.preload_finished && !st.abort {
                    event = self.finish_preload(&mut st);
                }
            }
            Err(e) => {
                warn!("会话 {} 范围下载失败 (serial {serial}): {e}", self.id);
                st.last_error = e.code();
                // 预载任务没有阻塞读取方兜底, 在这里直接换源重试
                let preload_active = st.preload_target > 0 && !st.preload_finished && !st.abort;
                if preload_active && self.options.download_type.is_prefetch() {
                    if st.url_list.is_empty() {
                        // 备选耗尽, 直接向宿主报错
                        event = Some(Event::Error(ErrorEvent {
                            url: st.real_url.clone(),
                            error: e.code(),
                        }));
                    } else {
                        let next = st.url_list.remove(0);
                        let change = UrlChange {
                            current_url: st.real_url.clone(),
                            http_code: 0,
                            next_url: next.clone(),
                        };
                        st.real_url = next;
                        st.last_error = 0;
                        st.serial += 1;
                        self.dispatch(&mut st);
                        event = Some(Event::UrlChange(change));
                    }
                }
            }
        }
        self.cond.notify_all();
        drop(st);
        if let Some(event) = event {
            self.listener.on_event(&event);
        }
    }

    fn on_event(&self, event: &Event) {
        self.listener.on_event(event);
    }

    fn on_speed(&self, bytes: i64, bytes_per_sec: i64, timestamp_ms: i64) {
        self.listener.on_speed(bytes, bytes_per_sec, timestamp_ms);
    }

    fn is_interrupted(&self) -> bool {
        self.state.lock().unwrap().abort || self.listener.is_interrupted()
    }
}

impl Drop for CacheSession {
    fn drop(&mut self) {
        // Weak 回调已无法升级, 只需确保任务不再引用下载器
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            task.stop();
        }
    }
}

fn cached_size(st: &SessionState) -> i64 {
    match &st.store {
        Some(store) => store.get_cache_size(&st.cache_key),
        None => 0,
    }
}

/// 窗口尾部是否像 CDN 错误页
fn looks_like_error_page(tail: &[u8]) -> bool {
    let text = String::from_utf8_lossy(tail);
    (text.contains("<html>") && text.contains("</html>")) || text.contains("<?xml version=")
}

fn error_from_code(code: i32) -> ChuanError {
    match code {
        c if c == ChuanError::Eof.code() => ChuanError::Eof,
        c if c == ChuanError::Timeout.code() => ChuanError::Timeout,
        c if c == ChuanError::ConnectTimeout.code() => ChuanError::ConnectTimeout,
        c if (-599..=-400).contains(&c) => ChuanError::Http((-c) as u16),
        c => ChuanError::Network(format!("下载错误码 {c}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DownloaderFactory;
    use crate::downloader::{DownloadStatus, Downloader};
    use crate::options::DownloadType;
    use aes::Aes128;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use cbc::Encryptor;
    use cbc::cipher::block_padding::NoPadding;
    use cbc::cipher::{BlockEncryptMut, KeyIvInit};
    use chuan_core::EngineConfig;
    use chuan_core::event::NoopListener;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    const FILE_LEN: i64 = 10_000;

    fn byte_at(pos: i64) -> u8 {
        (pos % 251) as u8
    }

    /// 按范围交付确定性内容的内存下载器
    struct PatternDownloader {
        status: Arc<DownloadStatus>,
        aborted: AtomicBool,
    }

    impl Downloader for PatternDownloader {
        fn run_download(&self, spec: &RangeSpec, sink: &dyn DataSink) -> ChuanResult<()> {
            self.status.set_http_code(206);
            sink.on_file_size(FILE_LEN);
            let end = if spec.end > 0 {
                spec.end.min(FILE_LEN)
            } else {
                FILE_LEN
            };
            let mut pos = spec.start;
            while pos < end {
                if self.aborted.load(Ordering::Relaxed) {
                    return Ok(());
                }
                let n = ((end - pos) as usize).min(1024);
                let chunk: Vec<u8> = (pos..pos + n as i64).map(byte_at).collect();
                let mut written = 0;
                while written < n {
                    match sink.write(&chunk[written..], spec.serial) {
                        WriteOutcome::Accepted(m) => written += m,
                        WriteOutcome::Pause => {
                            std::thread::sleep(Duration::from_millis(5));
                            if self.aborted.load(Ordering::Relaxed) {
                                return Ok(());
                            }
                        }
                        WriteOutcome::Stop => return Ok(()),
                    }
                }
                pos += n as i64;
            }
            Ok(())
        }

        fn pause(&self, _block: bool) {}
        fn resume(&self) {}
        fn abort(&self) {
            self.aborted.store(true, Ordering::Relaxed);
        }
        fn status(&self) -> Arc<DownloadStatus> {
            self.status.clone()
        }
    }

    fn pattern_factory() -> DownloaderFactory {
        Arc::new(|_opts| {
            Box::new(PatternDownloader {
                status: Arc::new(DownloadStatus::default()),
                aborted: AtomicBool::new(false),
            })
        })
    }

    fn small_config() -> EngineConfig {
        EngineConfig {
            thread_pool_size: 1,
            range_size: 2048,
            buffer_extra_size: 4096,
            ..EngineConfig::default()
        }
    }

    fn session_in(dir: &TempDir) -> Arc<CacheSession> {
        let ctx = EngineContext::with_factory(small_config(), pattern_factory());
        let options = Arc::new(DownloadOptions {
            download_type: DownloadType::Data,
            cache_dir: dir.path().to_str().unwrap().to_string(),
            ..DownloadOptions::default()
        });
        CacheSession::new(ctx, options, Arc::new(NoopListener))
    }

    fn read_fully(session: &CacheSession, buf: &mut [u8]) -> usize {
        let mut total = 0;
        while total < buf.len() {
            match session.read(&mut buf[total..]) {
                Ok(n) => total += n,
                Err(e) if e.is_again() => continue,
                Err(e) if e.is_eof() => break,
                Err(e) => panic!("读取失败: {e}"),
            }
        }
        total
    }

    #[test]
    fn stale_serial_write_rejected() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        session.open("http://cdn.test/v/clip.mp4").unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(read_fully(&session, &mut byte), 1);

        let outcome = session.write(&[0xAA; 16], 9999);
        assert_eq!(outcome, WriteOutcome::Stop);
        session.close();
    }

    #[test]
    fn seek_size_probe_reports_file_size() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        session.open("http://cdn.test/v/clip.mp4").unwrap();
        let mut byte = [0u8; 1];
        read_fully(&session, &mut byte);

        assert_eq!(session.seek(0, SEEK_SIZE).unwrap(), FILE_LEN);
        session.close();
    }

    #[test]
    fn in_window_seek_keeps_serial() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        session.open("http://cdn.test/v/clip.mp4").unwrap();
        let mut buf = [0u8; 64];
        read_fully(&session, &mut buf);

        let serial_before = session.state.lock().unwrap().serial;
        session.seek(100, 0).unwrap();
        assert_eq!(session.state.lock().unwrap().serial, serial_before);

        read_fully(&session, &mut buf);
        assert_eq!(buf[0], byte_at(100));
        session.close();
    }

    #[test]
    fn close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        session.open("http://cdn.test/v/clip.mp4").unwrap();
        session.close();
        session.close();
        assert!(session.read(&mut [0u8; 4]).is_err());
    }

    /// 加密区间设在第二个窗口里, 验证明文前缀不会提前解除解密
    const ENC_START: i64 = 2048;
    const ENC_LEN: usize = 32;

    fn build_token() -> String {
        let mut raw = Vec::with_capacity(44);
        raw.extend_from_slice(&(ENC_START as u32).to_le_bytes());
        raw.extend_from_slice(&(ENC_START as u32 + ENC_LEN as u32).to_le_bytes());
        raw.extend_from_slice(&[0x11u8; 16]);
        raw.extend_from_slice(&[0x22u8; 16]);
        raw.extend_from_slice(&1u32.to_le_bytes());
        STANDARD.encode(raw)
    }

    fn encrypted_segment(tok: &TokenInfo) -> [u8; ENC_LEN] {
        let mut seg = [0u8; ENC_LEN];
        for (i, b) in seg.iter_mut().enumerate() {
            *b = byte_at(ENC_START + i as i64);
        }
        let encryptor = Encryptor::<Aes128>::new((&tok.key).into(), (&tok.iv).into());
        encryptor
            .encrypt_padded_mut::<NoPadding>(&mut seg, ENC_LEN)
            .unwrap();
        seg
    }

    /// 交付模式内容, 但加密区间按密文交付
    struct CipherPatternDownloader {
        status: Arc<DownloadStatus>,
        cipher: [u8; ENC_LEN],
    }

    impl Downloader for CipherPatternDownloader {
        fn run_download(&self, spec: &RangeSpec, sink: &dyn DataSink) -> ChuanResult<()> {
            self.status.set_http_code(206);
            sink.on_file_size(FILE_LEN);
            let end = if spec.end > 0 {
                spec.end.min(FILE_LEN)
            } else {
                FILE_LEN
            };
            let mut pos = spec.start;
            while pos < end {
                if sink.is_interrupted() {
                    return Ok(());
                }
                let n = ((end - pos) as usize).min(1024);
                let mut chunk: Vec<u8> = (pos..pos + n as i64).map(byte_at).collect();
                for (i, b) in chunk.iter_mut().enumerate() {
                    let abs = pos + i as i64;
                    if abs >= ENC_START && abs < ENC_START + ENC_LEN as i64 {
                        *b = self.cipher[(abs - ENC_START) as usize];
                    }
                }
                let mut written = 0;
                while written < n {
                    match sink.write(&chunk[written..], spec.serial) {
                        WriteOutcome::Accepted(m) => written += m,
                        WriteOutcome::Pause => std::thread::sleep(Duration::from_millis(5)),
                        WriteOutcome::Stop => return Ok(()),
                    }
                }
                pos += n as i64;
            }
            Ok(())
        }

        fn pause(&self, _block: bool) {}
        fn resume(&self) {}
        fn abort(&self) {}
        fn status(&self) -> Arc<DownloadStatus> {
            self.status.clone()
        }
    }

    #[test]
    fn plain_prefix_keeps_decrypt_armed() {
        let token = build_token();
        let info = TokenInfo::parse(&token).unwrap();
        let cipher = encrypted_segment(&info);

        let dir = TempDir::new().unwrap();
        let factory: DownloaderFactory = Arc::new(move |_opts| {
            Box::new(CipherPatternDownloader {
                status: Arc::new(DownloadStatus::default()),
                cipher,
            })
        });
        let ctx = EngineContext::with_factory(small_config(), factory);
        let options = Arc::new(DownloadOptions {
            download_type: DownloadType::Data,
            cache_dir: dir.path().to_str().unwrap().to_string(),
            token,
            ..DownloadOptions::default()
        });
        let session = CacheSession::new(ctx, options, Arc::new(NoopListener));
        session.open("http://cdn.test/v/clip.mp4").unwrap();

        // 第一个窗口全是明文, 跨窗后加密区间必须被还原成明文
        let total = ENC_START as usize + ENC_LEN + 64;
        let mut content = vec![0u8; total];
        assert_eq!(read_fully(&session, &mut content), total);
        for (i, b) in content.iter().enumerate() {
            assert_eq!(*b, byte_at(i as i64), "位置 {i} 内容不符");
        }
        session.close();
    }

    #[test]
    fn error_page_sniff() {
        assert!(looks_like_error_page(
            b"<html><body>403 Forbidden</body></html>"
        ));
        assert!(looks_like_error_page(b"<?xml version=\"1.0\"?><Error/>"));
        assert!(!looks_like_error_page(&[0u8; 128]));
        assert!(!looks_like_error_page(b"<html> only opening tag"));
    }

    #[test]
    fn live_stream_rejects_seek() {
        let dir = TempDir::new().unwrap();
        let ctx = EngineContext::with_factory(small_config(), pattern_factory());
        let options = Arc::new(DownloadOptions {
            is_live: true,
            ..DownloadOptions::default()
        });
        let session = CacheSession::new(ctx, options, Arc::new(NoopListener));
        session.open("http://cdn.test/live/stream.flv").unwrap();
        assert!(matches!(
            session.seek(0, 0),
            Err(ChuanError::Unsupported(_))
        ));
        session.close();
    }
}
