//! 会话管理器集成测试.
//!
//! 走 `CacheManager` 的外部接口验证整条链路: 按 URL 定位会话的
//! 读取与定位、预载完成后的缓存查询与删除、Fifo 模式下的全量清场.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use chuan::cache::{
    CacheManager, DataSink, DownloadOptions, DownloadStatus, DownloadType, Downloader,
    DownloaderFactory, EngineContext, RangeSpec, WriteOutcome,
};
use chuan::core::event::{Event, EventListener, NoopListener};
use chuan::core::{ChuanError, ChuanResult, EngineConfig};

const FILE_LEN: i64 = 10_000;
const RANGE: usize = 2048;

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
            if self.aborted.load(Ordering::Relaxed) || sink.is_interrupted() {
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

/// 任何范围都立即失败的下载器
struct DeadDownloader {
    status: Arc<DownloadStatus>,
}

impl Downloader for DeadDownloader {
    fn run_download(&self, _spec: &RangeSpec, _sink: &dyn DataSink) -> ChuanResult<()> {
        Err(ChuanError::Network("离线".to_string()))
    }
    fn pause(&self, _block: bool) {}
    fn resume(&self) {}
    fn abort(&self) {}
    fn status(&self) -> Arc<DownloadStatus> {
        self.status.clone()
    }
}

fn dead_factory() -> DownloaderFactory {
    Arc::new(|_opts| {
        Box::new(DeadDownloader {
            status: Arc::new(DownloadStatus::default()),
        })
    })
}

/// 把分片完成事件转发到通道的监听器
struct FragmentWaiter {
    tx: Mutex<mpsc::Sender<i64>>,
}

impl EventListener for FragmentWaiter {
    fn on_event(&self, event: &Event) {
        if let Event::FragmentComplete(info) = event {
            let _ = self.tx.lock().unwrap().send(info.bytes);
        }
    }
}

/// 把会话释放事件转发到通道的监听器
struct ReleaseWaiter {
    tx: Mutex<mpsc::Sender<()>>,
}

impl EventListener for ReleaseWaiter {
    fn on_event(&self, event: &Event) {
        if matches!(event, Event::Release) {
            let _ = self.tx.lock().unwrap().send(());
        }
    }
}

fn small_config() -> EngineConfig {
    EngineConfig {
        thread_pool_size: 1,
        range_size: RANGE,
        buffer_extra_size: 2 * RANGE,
        ..EngineConfig::default()
    }
}

fn manager_with(factory: DownloaderFactory) -> CacheManager {
    CacheManager::with_context(EngineContext::with_factory(small_config(), factory))
}

fn play_options(dir: &TempDir) -> DownloadOptions {
    DownloadOptions {
        download_type: DownloadType::Data,
        cache_dir: dir.path().to_str().unwrap().to_string(),
        ..DownloadOptions::default()
    }
}

fn precache_options(dir: &TempDir, bytes: i64) -> DownloadOptions {
    DownloadOptions {
        download_type: DownloadType::Pre,
        preload_bytes: bytes,
        cache_dir: dir.path().to_str().unwrap().to_string(),
        ..DownloadOptions::default()
    }
}

fn read_via_manager(mgr: &CacheManager, url: &str, id: i64, buf: &mut [u8]) -> usize {
    let mut total = 0;
    while total < buf.len() {
        match mgr.read(url, id, &mut buf[total..]) {
            Ok(n) => total += n,
            Err(e) if e.is_again() => continue,
            Err(e) if e.is_eof() => break,
            Err(e) => panic!("读取失败: {e}"),
        }
    }
    total
}

// ============================================================
// 播放链路
// ============================================================

#[test]
fn play_read_and_seek_through_manager() {
    let dir = TempDir::new().unwrap();
    let mgr = manager_with(pattern_factory());
    let url = "http://cdn.test/v/clip.mp4";
    let id = mgr
        .open(url, play_options(&dir), Arc::new(NoopListener))
        .unwrap();

    let mut head = [0u8; 256];
    assert_eq!(read_via_manager(&mgr, url, id, &mut head), 256);
    for (i, b) in head.iter().enumerate() {
        assert_eq!(*b, byte_at(i as i64));
    }

    assert_eq!(mgr.seek(url, id, 5000, 0).unwrap(), 5000);
    let mut mid = [0u8; 128];
    assert_eq!(read_via_manager(&mgr, url, id, &mut mid), 128);
    for (i, b) in mid.iter().enumerate() {
        assert_eq!(*b, byte_at(5000 + i as i64));
    }

    mgr.close(url, id);
    assert!(mgr.read(url, id, &mut mid).is_err());
}

#[test]
fn open_rejects_non_http_url() {
    let mgr = manager_with(pattern_factory());
    let err = mgr
        .open(
            "file:///etc/passwd",
            DownloadOptions::default(),
            Arc::new(NoopListener),
        )
        .unwrap_err();
    assert!(matches!(err, ChuanError::InvalidArgument(_)));
}

// ============================================================
// 预载与缓存查询
// ============================================================

#[test]
fn preload_then_inspect_and_delete_cache() {
    let dir = TempDir::new().unwrap();
    let dir_str = dir.path().to_str().unwrap().to_string();
    let mgr = manager_with(pattern_factory());
    let url = "http://cdn.test/v/clip.mp4";

    let (tx, rx) = mpsc::channel();
    let id = mgr
        .open(
            url,
            precache_options(&dir, 4096),
            Arc::new(FragmentWaiter { tx: Mutex::new(tx) }),
        )
        .unwrap();

    let bytes = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("预载未在限期内完成");
    assert!(bytes >= 4096);

    assert!(mgr.get_cache_size(&dir_str, url) >= 4096);
    let keys = mgr.get_all_cached_files(&dir_str);
    assert!(keys.contains(&"_v_clip.mp4".to_string()));

    let path = mgr.get_cache_file_path(&dir_str, url);
    assert!(path.ends_with("_v_clip.mp4"));
    assert!(path.exists());

    mgr.close(url, id);
    assert!(mgr.delete_cache(&dir_str, url, true));
    assert_eq!(mgr.get_cache_size(&dir_str, url), 0);
    assert!(!path.exists());
}

#[test]
fn delete_cache_by_key_without_url() {
    let dir = TempDir::new().unwrap();
    let dir_str = dir.path().to_str().unwrap().to_string();
    let mgr = manager_with(pattern_factory());
    let url = "http://cdn.test/v/clip.mp4";

    let (tx, rx) = mpsc::channel();
    let id = mgr
        .open(
            url,
            precache_options(&dir, 2048),
            Arc::new(FragmentWaiter { tx: Mutex::new(tx) }),
        )
        .unwrap();
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    mgr.close(url, id);

    assert!(mgr.delete_cache(&dir_str, "_v_clip.mp4", false));
    assert!(!mgr.delete_cache(&dir_str, "_v_clip.mp4", false));
    assert!(!mgr.delete_cache(&dir_str, "", false));
}

// ============================================================
// 清场
// ============================================================

#[test]
fn stop_all_clears_precache_sessions() {
    let dir = TempDir::new().unwrap();
    let mgr = manager_with(dead_factory());
    let url = "http://cdn.test/v/pending.mp4";
    mgr.open(url, precache_options(&dir, 4096), Arc::new(NoopListener))
        .unwrap();
    // 预载还挂在池里, 按 URL 能找到会话
    mgr.update_preload_priority(url);

    mgr.stop("");
    let mut buf = [0u8; 16];
    assert!(matches!(mgr.read(url, 0, &mut buf), Err(ChuanError::Cache(_))));
}

#[test]
fn dropping_manager_closes_open_sessions() {
    let dir = TempDir::new().unwrap();
    let mgr = manager_with(pattern_factory());
    let url = "http://cdn.test/v/clip.mp4";

    let (tx, rx) = mpsc::channel();
    let id = mgr
        .open(
            url,
            play_options(&dir),
            Arc::new(ReleaseWaiter { tx: Mutex::new(tx) }),
        )
        .unwrap();
    let mut head = [0u8; 64];
    assert_eq!(read_via_manager(&mgr, url, id, &mut head), 64);

    // 三个池中的会话在管理器销毁时全部走正常关闭
    drop(mgr);
    rx.recv_timeout(Duration::from_secs(5))
        .expect("管理器销毁未关闭会话");
}

#[test]
fn play_and_precache_share_cache_entry_across_pools() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        preload_reopen: true,
        ..small_config()
    };
    let mgr = CacheManager::with_context(EngineContext::with_factory(config, pattern_factory()));
    let url = "http://cdn.test/v/clip.mp4";

    let play_id = mgr
        .open(url, play_options(&dir), Arc::new(NoopListener))
        .unwrap();

    // 放行配置下, 同一资源允许播放与预载并存, 共享同一缓存条目
    let (tx, rx) = mpsc::channel();
    mgr.open(
        url,
        precache_options(&dir, 4096),
        Arc::new(FragmentWaiter { tx: Mutex::new(tx) }),
    )
    .unwrap();
    rx.recv_timeout(Duration::from_secs(10))
        .expect("预载未在限期内完成");

    let mut buf = [0u8; 256];
    assert_eq!(read_via_manager(&mgr, url, play_id, &mut buf), 256);
    for (i, b) in buf.iter().enumerate() {
        assert_eq!(*b, byte_at(i as i64));
    }

    mgr.close(url, play_id);
    assert!(dir.path().join("_v_clip.mp4").exists());
}

#[test]
fn playing_open_displaces_precache_of_other_resource() {
    let dir = TempDir::new().unwrap();
    let mgr = manager_with(dead_factory());
    let pre_url = "http://cdn.test/v/next.mp4";
    mgr.open(pre_url, precache_options(&dir, 4096), Arc::new(NoopListener))
        .unwrap();

    let mgr2_url = "http://cdn.test/v/current.mp4";
    let id = mgr
        .open(mgr2_url, play_options(&dir), Arc::new(NoopListener))
        .unwrap();

    // 预载池被播放会话清空
    let mut buf = [0u8; 16];
    assert!(mgr.read(pre_url, 0, &mut buf).is_err());
    mgr.close(mgr2_url, id);
}
