//! 目录到存储实例的注册表.
//!
//! 不同用途的缓存 (播放、预载、广告) 可以落在不同目录,
//! 每个目录一个 `SegmentStore`. 注册表归 `EngineContext` 持有,
//! 没有进程级单例.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::warn;

use chuan_core::ChuanResult;

use crate::store::SegmentStore;

/// 目录级存储注册表
pub struct StoreManager {
    default_period: u32,
    stores: Mutex<HashMap<PathBuf, Arc<SegmentStore>>>,
}

impl StoreManager {
    pub fn new(default_period: u32) -> StoreManager {
        StoreManager {
            default_period,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// 取 (或建) 目录存储并配置容量, 首次访问触发目录扫描.
    ///
    /// 容量配置只对尚未扫描的存储生效, 后续调用只做查表.
    pub fn set_dir_capacity(
        &self,
        dir: &str,
        max_entries: usize,
        max_capacity: i64,
    ) -> ChuanResult<Arc<SegmentStore>> {
        let store = self.store_for(dir)?;
        store.set_limits(max_entries, max_capacity);
        if let Err(e) = store.load_directory_once() {
            warn!("缓存目录 {dir} 扫描失败: {e}");
        }
        Ok(store)
    }

    /// 取 (或建) 目录存储, 不改容量不触发扫描
    pub fn store_for(&self, dir: &str) -> ChuanResult<Arc<SegmentStore>> {
        let path = PathBuf::from(dir);
        let mut stores = self.stores.lock().unwrap();
        if let Some(store) = stores.get(&path) {
            return Ok(store.clone());
        }
        let store = Arc::new(SegmentStore::new(
            path.clone(),
            20,
            300 * 1024 * 1024,
            self.default_period,
        )?);
        stores.insert(path, store.clone());
        Ok(store)
    }

    /// 目录是否已有存储实例
    pub fn get(&self, dir: &Path) -> Option<Arc<SegmentStore>> {
        self.stores.lock().unwrap().get(dir).cloned()
    }

    /// 指定目录下某资源的已缓存字节数
    pub fn get_cache_size(&self, dir: &str, key: &str) -> i64 {
        match self.loaded_store(dir) {
            Ok(store) => store.get_cache_size(key),
            Err(_) => 0,
        }
    }

    /// 指定目录下全部缓存键
    pub fn get_all_cache_files(&self, dir: &str) -> Vec<String> {
        match self.loaded_store(dir) {
            Ok(store) => store.get_all_cache_files(),
            Err(_) => Vec::new(),
        }
    }

    /// 删除指定目录下某资源的缓存
    pub fn delete_cache(&self, dir: &str, key: &str) -> bool {
        match self.loaded_store(dir) {
            Ok(store) => store.delete_cache_file(key),
            Err(_) => false,
        }
    }

    /// 资源数据文件的磁盘路径
    pub fn cache_file_path(&self, dir: &str, key: &str) -> PathBuf {
        PathBuf::from(dir).join(key)
    }

    fn loaded_store(&self, dir: &str) -> ChuanResult<Arc<SegmentStore>> {
        let store = self.store_for(dir)?;
        store.load_directory_once()?;
        Ok(store)
    }
}
