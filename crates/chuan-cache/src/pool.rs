//! 下载任务线程池.
//!
//! 两类任务两种调度: 预载任务进入等待队列, 由固定数量的工作线程
//! 顺序消化 (任务一旦开跑不被抢占); 前台播放任务不排队, 立即获得
//! 一条专属线程. `LruMode::Lru` 时新预载插到队首, 最近提交的最先跑.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};

use chuan_core::config::LruMode;

use crate::task::DownloadTask;

struct PoolInner {
    prequeue: VecDeque<Arc<DownloadTask>>,
    /// 专属线程上的前台任务, 仅为回收完成者保留引用
    play_tasks: Vec<Arc<DownloadTask>>,
    running: bool,
}

/// 固定工作线程 + 前台专属线程的任务池
pub struct ThreadPool {
    inner: Arc<(Mutex<PoolInner>, Condvar)>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    lru_mode: LruMode,
}

impl ThreadPool {
    /// 创建并启动 `pool_size` 条预载工作线程
    pub fn new(pool_size: usize, lru_mode: LruMode) -> ThreadPool {
        let inner = Arc::new((
            Mutex::new(PoolInner {
                prequeue: VecDeque::new(),
                play_tasks: Vec::new(),
                running: true,
            }),
            Condvar::new(),
        ));

        let mut workers = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("chuan-pool-{i}"))
                .spawn(move || worker_loop(&inner))
                .expect("创建工作线程失败");
            workers.push(handle);
        }

        ThreadPool {
            inner,
            workers: Mutex::new(workers),
            lru_mode,
        }
    }

    /// 提交任务.
    ///
    /// 预载任务排队; 前台任务立即起专属线程, 并顺带回收已完成的
    /// 前台任务引用.
    pub fn add_task(&self, task: Arc<DownloadTask>, is_prefetch: bool) {
        let (lock, cond) = &*self.inner;
        let mut inner = lock.lock().unwrap();
        if !inner.running {
            warn!("任务池已关闭, 忽略提交");
            return;
        }
        if is_prefetch {
            if self.lru_mode == LruMode::Lru {
                inner.prequeue.push_front(task);
            } else {
                inner.prequeue.push_back(task);
            }
            debug!("预载任务入队, 队列长度 {}", inner.prequeue.len());
            cond.notify_one();
        } else {
            inner.play_tasks.retain(|t| !t.is_complete());
            let runner = task.clone();
            inner.play_tasks.push(task);
            drop(inner);
            let spawned = std::thread::Builder::new()
                .name("chuan-play".to_string())
                .spawn(move || runner.run_loop());
            if let Err(e) = spawned {
                warn!("创建前台下载线程失败: {e}");
            }
        }
    }

    /// 把排队中的预载任务提到队首
    pub fn move_task_to_head(&self, task: &Arc<DownloadTask>) {
        let (lock, _) = &*self.inner;
        let mut inner = lock.lock().unwrap();
        if let Some(pos) = inner.prequeue.iter().position(|t| Arc::ptr_eq(t, task)) {
            let t = inner.prequeue.remove(pos).unwrap();
            inner.prequeue.push_front(t);
        }
    }

    /// 把尚未开跑的预载任务移出队列
    pub fn delete_task(&self, task: &Arc<DownloadTask>) {
        let (lock, _) = &*self.inner;
        let mut inner = lock.lock().unwrap();
        if let Some(pos) = inner.prequeue.iter().position(|t| Arc::ptr_eq(t, task)) {
            inner.prequeue.remove(pos);
        }
    }

    /// 清空预载队列, 队列中的任务直接停掉
    pub fn clear_prefetch(&self) {
        let (lock, _) = &*self.inner;
        let drained: Vec<Arc<DownloadTask>> = {
            let mut inner = lock.lock().unwrap();
            inner.prequeue.drain(..).collect()
        };
        for task in drained {
            task.stop();
        }
    }

    /// 排队中的预载任务数
    pub fn pending_prefetch(&self) -> usize {
        self.inner.0.lock().unwrap().prequeue.len()
    }

    /// 关闭任务池并等待工作线程退出
    pub fn shutdown(&self) {
        {
            let (lock, cond) = &*self.inner;
            let mut inner = lock.lock().unwrap();
            if !inner.running {
                return;
            }
            inner.running = false;
            inner.prequeue.clear();
            inner.play_tasks.clear();
            cond.notify_all();
        }
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &Arc<(Mutex<PoolInner>, Condvar)>) {
    let (lock, cond) = &**inner;
    loop {
        let task = {
            let mut guard = lock.lock().unwrap();
            while guard.prequeue.is_empty() && guard.running {
                guard = cond.wait(guard).unwrap();
            }
            if !guard.running {
                return;
            }
            guard.prequeue.pop_front()
        };
        if let Some(task) = task {
            let done = task.run_once();
            debug!("预载任务执行完毕, 完整走完: {done}");
        }
    }
}
