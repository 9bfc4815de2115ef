//! 会话管理器: 按用途分池的会话编排.
//!
//! 三个池: 播放池 (前台读取)、预载池、广告池, 各有容量上限,
//! 超限时关掉最旧的会话. 同一资源按缓存键判重, 准入规则:
//!
//! - 打开播放会话会清空整个预载池与预载队列 (播放优先);
//! - 正在播放的资源不允许再发预载 (除非配置放行);
//! - 重复预载按 `LruMode` 处理: Fifo 关旧开新, Lru 提升旧任务
//!   优先级并复用, Reject 直接拒绝.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{info, warn};

use chuan_core::config::LruMode;
use chuan_core::event::EventListener;
use chuan_core::{ChuanError, ChuanResult, url};

use crate::context::EngineContext;
use crate::options::DownloadOptions;
use crate::session::CacheSession;

#[derive(Default)]
struct Pools {
    playing: Vec<Arc<CacheSession>>,
    precache: Vec<Arc<CacheSession>>,
    ads: Vec<Arc<CacheSession>>,
}

/// 分池会话管理器
pub struct CacheManager {
    ctx: Arc<EngineContext>,
    pools: Mutex<Pools>,
}

impl CacheManager {
    /// 以 HTTP 传输构建管理器
    #[cfg(feature = "http")]
    pub fn new(config: chuan_core::EngineConfig) -> CacheManager {
        CacheManager::with_context(EngineContext::new(config))
    }

    pub fn with_context(ctx: Arc<EngineContext>) -> CacheManager {
        CacheManager {
            ctx,
            pools: Mutex::new(Pools::default()),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// 打开会话: 按选项准入对应的池, 返回会话 id
    pub fn open(
        &self,
        open_url: &str,
        options: DownloadOptions,
        listener: Arc<dyn EventListener>,
    ) -> ChuanResult<i64> {
        if open_url.is_empty() || !open_url.starts_with("http") {
            return Err(ChuanError::InvalidArgument(format!(
                "非法下载地址: {open_url}"
            )));
        }
        let (session, is_new) = self.admit(open_url, options, listener)?;
        if is_new {
            session.open(open_url)
        } else {
            Ok(session.id())
        }
    }

    /// 阻塞读取, 会话按 URL (+id) 定位
    pub fn read(&self, target_url: &str, id: i64, buf: &mut [u8]) -> ChuanResult<usize> {
        match self.find(target_url, id) {
            Some(session) => session.read(buf),
            None => {
                warn!("读取失败, 无匹配会话: {target_url}");
                Err(ChuanError::Cache(format!("无匹配会话: {target_url}")))
            }
        }
    }

    /// 移动读取位置, 会话按 URL (+id) 定位
    pub fn seek(&self, target_url: &str, id: i64, offset: i64, whence: i32) -> ChuanResult<i64> {
        match self.find(target_url, id) {
            Some(session) => session.seek(offset, whence),
            None => Err(ChuanError::Cache(format!("无匹配会话: {target_url}"))),
        }
    }

    /// 关闭并移出匹配的会话 (三个池都找)
    pub fn close(&self, target_url: &str, id: i64) {
        let mut removed: Vec<Arc<CacheSession>> = Vec::new();
        {
            let mut pools = self.pools.lock().unwrap();
            extract_matches(&mut pools.precache, target_url, 0, &mut removed);
            extract_matches(&mut pools.playing, target_url, id, &mut removed);
            extract_matches(&mut pools.ads, target_url, 0, &mut removed);
        }
        for session in removed {
            session.close();
        }
    }

    /// 暂停指定资源的预载; URL 为空时 (Fifo 模式) 清掉全部预载
    pub fn stop(&self, target_url: &str) {
        if target_url.is_empty() {
            if self.ctx.config.preload_lru != LruMode::Fifo {
                return;
            }
            let drained: Vec<Arc<CacheSession>> = {
                let mut pools = self.pools.lock().unwrap();
                pools.precache.drain(..).collect()
            };
            self.ctx.pool.clear_prefetch();
            for session in drained {
                session.close();
            }
            info!("全部预载已清除");
            return;
        }
        let found = {
            let pools = self.pools.lock().unwrap();
            pools
                .precache
                .iter()
                .find(|s| matches_url(s, target_url))
                .cloned()
        };
        if let Some(session) = found {
            session.stop();
        }
    }

    /// 指定目录下某 URL 资源的已缓存字节数
    pub fn get_cache_size(&self, dir: &str, target_url: &str) -> i64 {
        if !target_url.starts_with("http") {
            return 0;
        }
        self.ctx
            .stores
            .get_cache_size(dir, &url::cache_key_of(target_url))
    }

    /// 指定目录下全部缓存键
    pub fn get_all_cached_files(&self, dir: &str) -> Vec<String> {
        self.ctx.stores.get_all_cache_files(dir)
    }

    /// 删除缓存. `is_full_url` 时 `target` 是完整 URL, 否则已是缓存键
    pub fn delete_cache(&self, dir: &str, target: &str, is_full_url: bool) -> bool {
        if target.is_empty() {
            return false;
        }
        let key = if is_full_url {
            if !target.starts_with("http") {
                return false;
            }
            url::cache_key_of(target)
        } else {
            target.to_string()
        };
        self.ctx.stores.delete_cache(dir, &key)
    }

    /// 某 URL 对应的缓存数据文件路径
    pub fn get_cache_file_path(&self, dir: &str, target_url: &str) -> PathBuf {
        self.ctx
            .stores
            .cache_file_path(dir, &url::cache_key_of(target_url))
    }

    /// 把某资源的预载任务提到队首
    pub fn update_preload_priority(&self, target_url: &str) {
        let found = {
            let pools = self.pools.lock().unwrap();
            pools
                .precache
                .iter()
                .find(|s| matches_url(s, target_url))
                .cloned()
        };
        if let Some(session) = found {
            session.update_preload_priority();
        }
    }

    /// 准入: 建会话并放进对应的池, 执行池间互斥与判重规则
    fn admit(
        &self,
        open_url: &str,
        options: DownloadOptions,
        listener: Arc<dyn EventListener>,
    ) -> ChuanResult<(Arc<CacheSession>, bool)> {
        let lru_mode = self.ctx.config.preload_lru;
        let max_sessions = self.ctx.config.max_sessions;
        let is_ads = options.download_type.is_ads();
        let is_precache = !is_ads && options.preload_bytes > 0;

        let mut to_close: Vec<Arc<CacheSession>> = Vec::new();
        let session = {
            let mut pools = self.pools.lock().unwrap();

            if is_ads {
                if let Some(pos) = position_of(&pools.ads, open_url) {
                    match lru_mode {
                        LruMode::Fifo => {
                            let old = pools.ads.remove(pos);
                            to_close.push(old);
                        }
                        LruMode::Reject => {
                            return Err(ChuanError::Cache(format!(
                                "广告资源重复提交: {open_url}"
                            )));
                        }
                        LruMode::Lru => {}
                    }
                }
                let session = CacheSession::new(
                    self.ctx.clone(),
                    Arc::new(options),
                    listener,
                );
                while pools.ads.len() >= max_sessions {
                    let old = pools.ads.remove(0);
                    to_close.push(old);
                }
                pools.ads.push(session.clone());
                session
            } else if !is_precache {
                // 播放会话: 预载全部让路
                self.ctx.pool.clear_prefetch();
                to_close.append(&mut pools.precache.drain(..).collect());
                if let Some(pos) = position_of(&pools.ads, open_url) {
                    let old = pools.ads.remove(pos);
                    to_close.push(old);
                }
                let session = CacheSession::new(
                    self.ctx.clone(),
                    Arc::new(options),
                    listener,
                );
                while pools.playing.len() >= max_sessions {
                    let old = pools.playing.remove(0);
                    to_close.push(old);
                }
                pools.playing.push(session.clone());
                session
            } else {
                if let Some(pos) = position_of(&pools.precache, open_url) {
                    match lru_mode {
                        LruMode::Fifo => {
                            let old = pools.precache.remove(pos);
                            to_close.push(old);
                        }
                        LruMode::Reject => {
                            return Err(ChuanError::Cache(format!(
                                "预载重复提交: {open_url}"
                            )));
                        }
                        LruMode::Lru => {
                            // 复用已有预载, 只把它的任务提到队首
                            let existing = pools.precache[pos].clone();
                            drop(pools);
                            existing.update_preload_priority();
                            return Ok((existing, false));
                        }
                    }
                }
                if position_of(&pools.playing, open_url).is_some()
                    && !self.ctx.config.preload_reopen
                {
                    return Err(ChuanError::Cache(format!(
                        "资源正在播放, 拒绝预载: {open_url}"
                    )));
                }
                let session = CacheSession::new(
                    self.ctx.clone(),
                    Arc::new(options),
                    listener,
                );
                while pools.precache.len() >= max_sessions {
                    let old = pools.precache.remove(0);
                    to_close.push(old);
                }
                pools.precache.push(session.clone());
                session
            }
        };
        for old in to_close {
            old.close();
        }
        Ok((session, true))
    }

    fn find(&self, target_url: &str, id: i64) -> Option<Arc<CacheSession>> {
        let pools = self.pools.lock().unwrap();
        pools
            .playing
            .iter()
            .find(|s| matches_url(s, target_url) && (id == 0 || s.id() == id))
            .cloned()
            .or_else(|| {
                pools
                    .precache
                    .iter()
                    .find(|s| matches_url(s, target_url))
                    .cloned()
            })
            .or_else(|| {
                pools
                    .ads
                    .iter()
                    .find(|s| matches_url(s, target_url))
                    .cloned()
            })
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        let mut sessions: Vec<Arc<CacheSession>> = Vec::new();
        {
            let mut pools = self.pools.lock().unwrap();
            sessions.extend(pools.playing.drain(..));
            sessions.extend(pools.precache.drain(..));
            sessions.extend(pools.ads.drain(..));
        }
        for session in sessions {
            session.close();
        }
    }
}

fn matches_url(session: &CacheSession, target_url: &str) -> bool {
    url::same_resource(&session.opened_url(), target_url)
}

fn position_of(pool: &[Arc<CacheSession>], target_url: &str) -> Option<usize> {
    pool.iter().position(|s| matches_url(s, target_url))
}

fn extract_matches(
    pool: &mut Vec<Arc<CacheSession>>,
    target_url: &str,
    id: i64,
    out: &mut Vec<Arc<CacheSession>>,
) {
    let mut i = 0;
    while i < pool.len() {
        if matches_url(&pool[i], target_url) && (id == 0 || pool[i].id() == id) {
            out.push(pool.remove(i));
        } else {
            i += 1;
        }
    }
}
