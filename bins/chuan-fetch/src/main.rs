//! chuan-fetch - 分段缓存下载命令行工具
//!
//! 对 chuan-cache 引擎的命令行封装: 预载资源到本地缓存目录,
//! 查看、删除缓存条目, 查询缓存文件路径.

use std::process;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};

use chuan_cache::{CacheManager, DownloadOptions, DownloadType};
use chuan_core::EngineConfig;
use chuan_core::event::{Event, EventListener};

mod logging;

/// Chuan 分段缓存下载工具
#[derive(Parser, Debug)]
#[command(name = "chuan-fetch", version, about = "Chuan 分段缓存下载命令行工具")]
struct Cli {
    /// 日志级别 (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 预载资源的前若干字节到缓存目录
    Preload {
        /// 资源 URL (http/https)
        url: String,

        /// 缓存目录
        #[arg(long, default_value = "chuan-cache")]
        dir: String,

        /// 预载字节数, 0 表示整个文件
        #[arg(long, default_value_t = 1024 * 1024)]
        bytes: i64,

        /// 预载工作线程数
        #[arg(long, default_value_t = 1)]
        threads: usize,

        /// 等待超时 (秒)
        #[arg(long, default_value_t = 60)]
        timeout: u64,

        /// 解密 token (base64)
        #[arg(long, default_value = "")]
        token: String,

        /// 将 http 升级为 https
        #[arg(long)]
        https: bool,

        /// 多源 URL 分隔符, 为空不启用换源
        #[arg(long, default_value = "")]
        separator: String,
    },

    /// 列出缓存目录下的全部条目
    List {
        /// 缓存目录
        #[arg(long, default_value = "chuan-cache")]
        dir: String,

        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },

    /// 删除缓存条目
    Delete {
        /// 缓存键, 或配合 --url 传完整 URL
        target: String,

        /// 缓存目录
        #[arg(long, default_value = "chuan-cache")]
        dir: String,

        /// target 是完整 URL 而非缓存键
        #[arg(long)]
        url: bool,
    },

    /// 查询某 URL 对应的缓存数据文件路径
    Path {
        /// 资源 URL
        url: String,

        /// 缓存目录
        #[arg(long, default_value = "chuan-cache")]
        dir: String,
    },
}

// ============================================================
// JSON 输出结构体
// ============================================================

/// 单个缓存条目
#[derive(Serialize)]
struct CacheEntry {
    key: String,
    cached_bytes: i64,
    path: String,
}

/// list 命令输出
#[derive(Serialize)]
struct ListOutput {
    dir: String,
    entries: Vec<CacheEntry>,
    total_bytes: i64,
}

// ============================================================
// 预载事件监听
// ============================================================

/// 预载结果: 完成字节数或错误码
enum PreloadOutcome {
    Done(i64),
    Failed(i32),
}

/// 把预载完成/错误事件转发到主线程的监听器
struct WaitListener {
    tx: Mutex<mpsc::Sender<PreloadOutcome>>,
}

impl EventListener for WaitListener {
    fn on_event(&self, event: &Event) {
        match event {
            Event::FragmentComplete(info) => {
                let _ = self
                    .tx
                    .lock()
                    .unwrap()
                    .send(PreloadOutcome::Done(info.bytes));
            }
            Event::Error(err) => {
                let _ = self.tx.lock().unwrap().send(PreloadOutcome::Failed(err.error));
            }
            Event::UrlChange(change) => {
                info!(
                    "换源: {} (http {}) -> {}",
                    change.current_url, change.http_code, change.next_url
                );
            }
            other => debug!("事件: {other:?}"),
        }
    }

    fn on_speed(&self, bytes: i64, bytes_per_sec: i64, _timestamp_ms: i64) {
        debug!("速度采样: 累计 {bytes} 字节, {bytes_per_sec} B/s");
    }
}

// ============================================================
// 主逻辑
// ============================================================

fn main() {
    let cli = Cli::parse();
    logging::init("chuan-fetch", cli.verbose);

    match cli.command {
        Command::Preload {
            url,
            dir,
            bytes,
            threads,
            timeout,
            token,
            https,
            separator,
        } => run_preload(&url, &dir, bytes, threads, timeout, token, https, separator),
        Command::List { dir, json } => run_list(&dir, json),
        Command::Delete { target, dir, url } => run_delete(&target, &dir, url),
        Command::Path { url, dir } => run_path(&url, &dir),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_preload(
    url: &str,
    dir: &str,
    bytes: i64,
    threads: usize,
    timeout: u64,
    token: String,
    https: bool,
    separator: String,
) {
    let config = EngineConfig {
        thread_pool_size: threads.max(1),
        ..EngineConfig::default()
    };
    let manager = CacheManager::new(config);

    let (tx, rx) = mpsc::channel();
    let listener = Arc::new(WaitListener { tx: Mutex::new(tx) });

    let options = DownloadOptions {
        download_type: DownloadType::Pre,
        preload_bytes: bytes,
        cache_dir: dir.to_string(),
        use_https: https,
        url_list_separator: separator,
        token,
        ..DownloadOptions::default()
    };

    info!("预载 {url} -> {dir} ({bytes} 字节)");
    let id = match manager.open(url, options, listener) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("错误: 无法打开会话: {e}");
            process::exit(1);
        }
    };

    match rx.recv_timeout(Duration::from_secs(timeout)) {
        Ok(PreloadOutcome::Done(done_bytes)) => {
            manager.close(url, id);
            println!("预载完成: {} ({done_bytes} 字节已缓存)", url);
        }
        Ok(PreloadOutcome::Failed(code)) => {
            manager.close(url, id);
            eprintln!("错误: 预载失败, 错误码 {code}");
            process::exit(1);
        }
        Err(_) => {
            manager.close(url, id);
            eprintln!("错误: 预载超时 ({timeout} 秒)");
            process::exit(1);
        }
    }
}

fn run_list(dir: &str, json: bool) {
    let manager = CacheManager::new(EngineConfig::default());
    let keys = manager.get_all_cached_files(dir);

    let mut entries = Vec::with_capacity(keys.len());
    let mut total_bytes = 0i64;
    for key in keys {
        let cached_bytes = manager.context().stores.get_cache_size(dir, &key);
        let path = manager.context().stores.cache_file_path(dir, &key);
        total_bytes += cached_bytes;
        entries.push(CacheEntry {
            key,
            cached_bytes,
            path: path.display().to_string(),
        });
    }

    if json {
        let output = ListOutput {
            dir: dir.to_string(),
            entries,
            total_bytes,
        };
        let text = serde_json::to_string_pretty(&output).unwrap();
        println!("{text}");
    } else {
        if entries.is_empty() {
            println!("缓存目录为空: {dir}");
            return;
        }
        println!("[CACHE {dir}]");
        for entry in &entries {
            println!(
                "  {}  {}  {}",
                entry.key,
                format_bytes(entry.cached_bytes),
                entry.path
            );
        }
        println!("[/CACHE] 共 {} 条, {}", entries.len(), format_bytes(total_bytes));
    }
}

fn run_delete(target: &str, dir: &str, is_full_url: bool) {
    let manager = CacheManager::new(EngineConfig::default());
    if manager.delete_cache(dir, target, is_full_url) {
        println!("已删除: {target}");
    } else {
        eprintln!("错误: 未找到缓存条目: {target}");
        process::exit(1);
    }
}

fn run_path(url: &str, dir: &str) {
    let manager = CacheManager::new(EngineConfig::default());
    let path = manager.get_cache_file_path(dir, url);
    println!("{}", path.display());
}

/// 人类可读的字节数
fn format_bytes(bytes: i64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
