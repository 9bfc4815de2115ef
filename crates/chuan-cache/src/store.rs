//! 单目录分段磁盘缓存.
//!
//! 每个被缓存的资源对应两个文件: 数据文件 `<key>` 与边车映射文件
//! `<key>-map`. 数据文件按 period (默认 1 MiB) 为槽位紧凑排列,
//! 逻辑位置与物理槽位的对应关系记录在映射文件里, 因此可以乱序
//! 缓存文件中间的任意分段.
//!
//! 目录级维护 LRU: 条目数超过 `max_entries` 或物理总量超过
//! `max_capacity` 时从最久未用端淘汰, 被会话引用 (pin_count > 0)
//! 的条目跳过. 所有磁盘故障均不致命: 记日志、返回空读/错误,
//! 调用方按缓存未命中处理重新下载.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{info, warn};

use chuan_core::{ChuanError, ChuanResult};

/// 映射文件行前缀
const KEY_FILE_SIZE: &str = "total_file_size:";
const KEY_CACHE_SIZE: &str = "cache_file_size:";
const KEY_PERIOD_SIZE: &str = "cache_period_size:";
const KEY_ENTRY_LOGICAL: &str = "entry_logical_pos:";
const KEY_ENTRY_DATA: &str = "entry_data_amount:";
const KEY_ENTRY_PHYSICAL: &str = "entry_physical_pos:";
const KEY_ENTRY_FLUSH: &str = "entry_info_flush";

/// 一个已缓存分段: 逻辑区间 [logical_pos, logical_pos + data_amount)
/// 存放在数据文件物理偏移 physical_pos 处
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentEntry {
    pub logical_pos: u64,
    pub physical_pos: u64,
    pub data_amount: u32,
}

/// 单个资源的缓存状态
struct CachePath {
    data_path: PathBuf,
    file: Option<File>,
    /// 逻辑文件总大小, 0 表示未知
    file_size: i64,
    /// 已缓存字节数 (各分段 data_amount 之和)
    cached_bytes: i64,
    /// 槽位宽度, 0 表示沿用目录默认
    period_size: u32,
    entries: HashMap<u64, SegmentEntry>,
    /// 引用计数, 非零时不参与淘汰
    pin_count: u32,
}

impl CachePath {
    fn new(data_path: PathBuf) -> CachePath {
        CachePath {
            data_path,
            file: None,
            file_size: 0,
            cached_bytes: 0,
            period_size: 0,
            entries: HashMap::new(),
            pin_count: 0,
        }
    }

    fn map_path(&self) -> PathBuf {
        let mut name = self.data_path.as_os_str().to_os_string();
        name.push("-map");
        PathBuf::from(name)
    }
}

struct StoreInner {
    dir: PathBuf,
    inited: bool,
    max_entries: usize,
    max_capacity: i64,
    default_period: u32,
    /// 目录内全部已缓存字节
    total_bytes: i64,
    paths: HashMap<String, CachePath>,
    /// 最近使用顺序, 队首为最新
    order: Vec<String>,
}

/// 单目录分段缓存存储
pub struct SegmentStore {
    inner: Mutex<StoreInner>,
}

impl SegmentStore {
    /// 创建存储实例并确保目录存在
    pub fn new(
        dir: impl Into<PathBuf>,
        max_entries: usize,
        max_capacity: i64,
        default_period: u32,
    ) -> ChuanResult<SegmentStore> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(SegmentStore {
            inner: Mutex::new(StoreInner {
                dir,
                inited: false,
                max_entries,
                max_capacity,
                default_period,
                total_bytes: 0,
                paths: HashMap::new(),
                order: Vec::new(),
            }),
        })
    }

    /// 调整容量上限, 目录扫描完成后不再生效
    pub fn set_limits(&self, max_entries: usize, max_capacity: i64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.inited {
            return;
        }
        inner.max_entries = max_entries;
        inner.max_capacity = max_capacity;
    }

    /// 扫描缓存目录重建索引, 幂等, 只有首次调用做实际工作.
    ///
    /// 映射文件缺失或为空的孤儿数据文件直接删除; 扫描完成后
    /// 如超出容量立即淘汰.
    pub fn load_directory_once(&self) -> ChuanResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.inited {
            return Ok(());
        }
        inner.inited = true;

        let read_dir = match fs::read_dir(&inner.dir) {
            Ok(rd) => rd,
            Err(e) => {
                warn!("缓存目录 {} 无法打开: {e}", inner.dir.display());
                return Err(ChuanError::Io(e));
            }
        };

        let mut orphans: Vec<PathBuf> = Vec::new();
        for entry in read_dir.flatten() {
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if name.ends_with("-map") || name == ".DS_Store" {
                continue;
            }
            let data_path = entry.path();
            if data_path.is_dir() {
                continue;
            }
            let mut map_name = data_path.as_os_str().to_os_string();
            map_name.push("-map");
            let map_path = PathBuf::from(map_name);
            let map_len = fs::metadata(&map_path).map(|m| m.len()).unwrap_or(0);
            if map_len == 0 {
                orphans.push(data_path);
                continue;
            }

            let mut cache_path = CachePath::new(data_path);
            parse_cache_info(&map_path, &mut cache_path, inner.default_period);
            inner.total_bytes += cache_path.cached_bytes;
            inner.paths.insert(name.clone(), cache_path);
            inner.order.insert(0, name);
        }

        for data_path in orphans {
            let mut map_name = data_path.as_os_str().to_os_string();
            map_name.push("-map");
            let _ = fs::remove_file(&data_path);
            let _ = fs::remove_file(PathBuf::from(map_name));
        }

        while inner.total_bytes > inner.max_capacity {
            if !evict_tail(&mut inner) {
                break;
            }
        }
        info!(
            "缓存目录 {} 扫描完成: {} 个条目, {} 字节",
            inner.dir.display(),
            inner.paths.len(),
            inner.total_bytes
        );
        Ok(())
    }

    /// 打开 (并引用) 一个缓存条目, 不存在则创建空文件对.
    ///
    /// 每次 open 对应一次 `close_cache_file`, 引用期间该条目不被淘汰.
    pub fn open_cache_file(&self, key: &str) -> ChuanResult<()> {
        if key.is_empty() {
            return Err(ChuanError::InvalidArgument("缓存键为空".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.paths.contains_key(key) {
            let data_path = inner.dir.join(key);
            let cache_path = CachePath::new(data_path.clone());
            File::create(&data_path)?;
            File::create(cache_path.map_path())?;
            inner.paths.insert(key.to_string(), cache_path);
            inner.order.insert(0, key.to_string());
        }
        if let Some(cp) = inner.paths.get_mut(key) {
            cp.pin_count += 1;
        }
        move_to_head(&mut inner, key);
        evict_over_limit(&mut inner);
        Ok(())
    }

    /// 关闭一个缓存条目: 刷映射文件、关句柄、解除一次引用
    pub fn close_cache_file(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        let default_period = inner.default_period;
        let Some(cp) = inner.paths.get_mut(key) else {
            warn!("关闭缓存条目失败, {key} 不存在");
            return;
        };
        save_cache_info(cp, default_period);
        cp.file = None;
        cp.pin_count = cp.pin_count.saturating_sub(1);
    }

    /// 读取覆盖 `offset` 的分段到 `buf`, 返回读到的字节数.
    ///
    /// `offset` 按 period 对齐后查槽位, 未命中返回 0.
    pub fn get_cache_file(&self, key: &str, offset: u64, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let default_period = inner.default_period;
        let n = {
            let StoreInner {
                paths, total_bytes, ..
            } = &mut *inner;
            let Some(cp) = paths.get_mut(key) else {
                return 0;
            };
            let period = effective_period(cp, default_period) as u64;
            let slot = (offset / period) * period;
            match cp.entries.get(&slot).copied() {
                None => 0,
                Some(entry) => {
                    if cp.file.is_none() && !reopen_data_file(cp, total_bytes) {
                        0
                    } else {
                        let amount = (entry.data_amount as usize).min(buf.len());
                        match read_slot(cp, entry.physical_pos, &mut buf[..amount]) {
                            Ok(n) => n,
                            Err(e) => {
                                warn!("读取缓存槽位失败 {key}@{slot}: {e}");
                                0
                            }
                        }
                    }
                }
            }
        };
        move_to_head(&mut inner, key);
        evict_over_limit(&mut inner);
        n
    }

    /// 写入一个分段. `start_pos` 必须按 period 对齐, `data` 为有效字节.
    ///
    /// 同槽位的重复写入只在增长时落盘, 账目单调不减.
    pub fn update_cache_info(&self, key: &str, start_pos: u64, data: &[u8]) -> ChuanResult<()> {
        if key.is_empty() {
            return Err(ChuanError::InvalidArgument("缓存键为空".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        let default_period = inner.default_period;
        let mut total_delta: i64 = 0;
        let result = {
            let Some(cp) = inner.paths.get_mut(key) else {
                return Err(ChuanError::Cache(format!("缓存条目 {key} 不存在")));
            };
            let period = effective_period(cp, default_period);
            if cp.period_size == 0 {
                cp.period_size = period;
            }
            debug_assert_eq!(start_pos % period as u64, 0);
            debug_assert!(data.len() <= period as usize);

            if cp.file.is_none() && !reopen_data_file_pinned(cp) {
                return Err(ChuanError::Cache(format!("缓存条目 {key} 数据文件不可用")));
            }

            let length = data.len() as u32;
            match cp.entries.get(&start_pos).copied() {
                Some(old) if old.data_amount >= length => Ok(()),
                Some(old) => {
                    // 原槽位增长重写
                    write_slot(cp, old.physical_pos, data).map(|_| {
                        let delta = length as i64 - old.data_amount as i64;
                        cp.cached_bytes += delta;
                        total_delta = delta;
                        cp.entries.insert(
                            start_pos,
                            SegmentEntry {
                                logical_pos: start_pos,
                                physical_pos: old.physical_pos,
                                data_amount: length,
                            },
                        );
                    })
                }
                None => {
                    // 新槽位追加在文件末尾
                    let end = cp
                        .file
                        .as_mut()
                        .map(|f| f.seek(SeekFrom::End(0)))
                        .transpose()?
                        .unwrap_or(0);
                    let physical_pos = end.div_ceil(period as u64) * period as u64;
                    write_slot(cp, physical_pos, data).map(|_| {
                        cp.cached_bytes += length as i64;
                        total_delta = length as i64;
                        cp.entries.insert(
                            start_pos,
                            SegmentEntry {
                                logical_pos: start_pos,
                                physical_pos,
                                data_amount: length,
                            },
                        );
                    })
                }
            }
        };
        inner.total_bytes += total_delta;
        evict_over_limit(&mut inner);
        result
    }

    /// 逻辑文件总大小与 period, 条目不存在时为 None, 大小 0 表示未知
    pub fn get_file_size(&self, key: &str) -> Option<(i64, u32)> {
        let inner = self.inner.lock().unwrap();
        let cp = inner.paths.get(key)?;
        Some((cp.file_size, effective_period(cp, inner.default_period)))
    }

    /// 记录逻辑文件总大小
    pub fn set_file_size(&self, key: &str, file_size: i64) {
        let mut inner = self.inner.lock().unwrap();
        match inner.paths.get_mut(key) {
            Some(cp) => cp.file_size = file_size,
            None => warn!("记录文件大小失败, {key} 不存在"),
        }
    }

    /// 该资源已缓存的字节数
    pub fn get_cache_size(&self, key: &str) -> i64 {
        let inner = self.inner.lock().unwrap();
        inner.paths.get(key).map(|cp| cp.cached_bytes).unwrap_or(0)
    }

    /// 目录内全部已缓存字节
    pub fn total_bytes(&self) -> i64 {
        self.inner.lock().unwrap().total_bytes
    }

    /// 当前全部缓存键
    pub fn get_all_cache_files(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.paths.keys().cloned().collect()
    }

    /// 删除指定资源的缓存, 被引用时拒绝
    pub fn delete_cache_file(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        evict_key(&mut inner, key)
    }

    /// 资源对应的数据文件路径
    pub fn cache_file_path(&self, key: &str) -> PathBuf {
        self.inner.lock().unwrap().dir.join(key)
    }
}

fn effective_period(cp: &CachePath, default_period: u32) -> u32 {
    if cp.period_size > 0 {
        cp.period_size
    } else {
        default_period
    }
}

fn move_to_head(inner: &mut StoreInner, key: &str) {
    if let Some(pos) = inner.order.iter().position(|k| k == key) {
        let k = inner.order.remove(pos);
        inner.order.insert(0, k);
    }
}

fn evict_over_limit(inner: &mut StoreInner) {
    while inner.paths.len() > inner.max_entries || inner.total_bytes > inner.max_capacity {
        if !evict_tail(inner) {
            break;
        }
    }
}

/// 从最久未用端淘汰一个未被引用的条目, 无可淘汰时返回 false
fn evict_tail(inner: &mut StoreInner) -> bool {
    let victim = inner
        .order
        .iter()
        .rev()
        .find(|k| {
            inner
                .paths
                .get(k.as_str())
                .is_some_and(|cp| cp.pin_count == 0)
        })
        .cloned();
    match victim {
        Some(key) => evict_key(inner, &key),
        None => false,
    }
}

fn evict_key(inner: &mut StoreInner, key: &str) -> bool {
    let Some(cp) = inner.paths.get(key) else {
        return false;
    };
    if cp.pin_count > 0 {
        warn!("缓存条目 {key} 正被引用, 跳过删除");
        return false;
    }
    let cp = inner.paths.remove(key).unwrap();
    if let Some(pos) = inner.order.iter().position(|k| k == key) {
        inner.order.remove(pos);
    }
    if cp.cached_bytes > 0 {
        inner.total_bytes -= cp.cached_bytes;
    }
    let _ = fs::remove_file(&cp.data_path);
    let _ = fs::remove_file(cp.map_path());
    info!("淘汰缓存条目 {key}, 释放 {} 字节", cp.cached_bytes);
    true
}

/// 数据文件丢失时重建空文件对, 索引清零
fn recreate_cache_file(cp: &mut CachePath) -> bool {
    cp.entries.clear();
    cp.cached_bytes = 0;
    if File::create(cp.map_path()).is_err() {
        warn!("重建映射文件失败: {}", cp.map_path().display());
        return false;
    }
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cp.data_path)
    {
        Ok(f) => {
            cp.file = Some(f);
            true
        }
        Err(e) => {
            warn!("重建数据文件失败 {}: {e}", cp.data_path.display());
            false
        }
    }
}

fn reopen_data_file(cp: &mut CachePath, total_bytes: &mut i64) -> bool {
    match OpenOptions::new().read(true).write(true).open(&cp.data_path) {
        Ok(f) => {
            cp.file = Some(f);
            true
        }
        Err(_) => {
            // 数据文件被外部清掉, 索引随之作废
            let lost = cp.cached_bytes;
            if recreate_cache_file(cp) {
                *total_bytes -= lost;
                true
            } else {
                false
            }
        }
    }
}

fn reopen_data_file_pinned(cp: &mut CachePath) -> bool {
    match OpenOptions::new().read(true).write(true).open(&cp.data_path) {
        Ok(f) => {
            cp.file = Some(f);
            true
        }
        Err(e) => {
            warn!("重新打开数据文件失败 {}: {e}", cp.data_path.display());
            false
        }
    }
}

fn read_slot(cp: &mut CachePath, physical_pos: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    let file = cp.file.as_mut().expect("data file open");
    file.seek(SeekFrom::Start(physical_pos))?;
    let mut read = 0;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}

fn write_slot(cp: &mut CachePath, physical_pos: u64, data: &[u8]) -> ChuanResult<()> {
    let file = cp.file.as_mut().expect("data file open");
    file.seek(SeekFrom::Start(physical_pos))?;
    file.write_all(data)?;
    Ok(())
}

/// 序列化索引到映射文件, 失败时删除映射文件避免留下半截状态
fn save_cache_info(cp: &mut CachePath, default_period: u32) {
    if cp.period_size == 0 {
        cp.period_size = default_period;
    }
    let mut config = String::new();
    config.push_str(&format!("{KEY_FILE_SIZE}{}\n", cp.file_size));
    config.push_str(&format!("{KEY_CACHE_SIZE}{}\n", cp.cached_bytes));
    config.push_str(&format!("{KEY_PERIOD_SIZE}{}\n", cp.period_size));
    let mut entries: Vec<&SegmentEntry> = cp.entries.values().collect();
    entries.sort_by_key(|e| e.logical_pos);
    for entry in entries {
        config.push_str(&format!("{KEY_ENTRY_LOGICAL}{}\n", entry.logical_pos));
        config.push_str(&format!("{KEY_ENTRY_DATA}{}\n", entry.data_amount));
        config.push_str(&format!("{KEY_ENTRY_PHYSICAL}{}\n", entry.physical_pos));
        config.push_str(KEY_ENTRY_FLUSH);
        config.push('\n');
    }
    let map_path = cp.map_path();
    if let Err(e) = fs::write(&map_path, config) {
        warn!("写映射文件失败 {}: {e}", map_path.display());
        let _ = fs::remove_file(&map_path);
    }
}

fn parse_num(line: &str, prefix: &str) -> Option<u64> {
    let rest = line.strip_prefix(prefix)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// 解析映射文件重建索引, 无法识别的行一律跳过
fn parse_cache_info(map_path: &Path, cp: &mut CachePath, default_period: u32) {
    let content = match fs::read(map_path) {
        Ok(c) => c,
        Err(e) => {
            warn!("打开映射文件失败 {}: {e}", map_path.display());
            return;
        }
    };
    let content = String::from_utf8_lossy(&content);

    let mut logical_pos: u64 = 0;
    let mut physical_pos: u64 = 0;
    let mut data_amount: u64 = 0;
    for line in content.lines() {
        if let Some(v) = parse_num(line, KEY_FILE_SIZE) {
            cp.file_size = v as i64;
        } else if let Some(v) = parse_num(line, KEY_CACHE_SIZE) {
            cp.cached_bytes = v as i64;
        } else if let Some(v) = parse_num(line, KEY_PERIOD_SIZE) {
            cp.period_size = v as u32;
        } else if let Some(v) = parse_num(line, KEY_ENTRY_LOGICAL) {
            logical_pos = v;
        } else if let Some(v) = parse_num(line, KEY_ENTRY_DATA) {
            data_amount = v;
        } else if let Some(v) = parse_num(line, KEY_ENTRY_PHYSICAL) {
            physical_pos = v;
        } else if line.contains(KEY_ENTRY_FLUSH) {
            cp.entries.insert(
                logical_pos,
                SegmentEntry {
                    logical_pos,
                    physical_pos,
                    data_amount: data_amount as u32,
                },
            );
        }
    }
    if cp.period_size == 0 {
        cp.period_size = default_period;
    }
}
