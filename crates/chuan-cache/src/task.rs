//! 下载任务: 一个专属线程上的范围下载循环.
//!
//! 任务启动后反复执行 "下载当前范围 → 等待新参数":
//! 会话 seek 或窗口推进时以 `update_param` 递交新范围并唤醒循环,
//! 传输失败的任务同样停驻在等待中, 可被新参数复活.
//! `stop` 置中止标志并唤醒, 循环退出后任务进入完成态.

use std::sync::{Arc, Condvar, Mutex, Weak};

use log::{debug, info};

use crate::downloader::{DataSink, DownloadStatus, Downloader, RangeSpec};

struct TaskState {
    spec: Option<RangeSpec>,
    sink: Option<Weak<dyn DataSink>>,
    abort: bool,
    update: bool,
    complete: bool,
}

/// 范围下载任务
pub struct DownloadTask {
    state: Mutex<TaskState>,
    cond: Condvar,
    downloader: Box<dyn Downloader>,
}

impl DownloadTask {
    pub fn new(downloader: Box<dyn Downloader>) -> Arc<DownloadTask> {
        Arc::new(DownloadTask {
            state: Mutex::new(TaskState {
                spec: None,
                sink: None,
                abort: false,
                update: false,
                complete: false,
            }),
            cond: Condvar::new(),
            downloader,
        })
    }

    /// 绑定下载参数与数据接收方.
    ///
    /// 接收方以弱引用持有: 会话先于任务释放时, 循环自行退出.
    pub fn set_parameter(&self, spec: RangeSpec, sink: Weak<dyn DataSink>) {
        let mut state = self.state.lock().unwrap();
        state.spec = Some(spec);
        state.sink = Some(sink);
    }

    /// 递交新范围并唤醒等待中的循环
    pub fn update_param(&self, spec: RangeSpec) {
        let mut state = self.state.lock().unwrap();
        state.spec = Some(spec);
        state.update = true;
        self.cond.notify_all();
        drop(state);
        self.downloader.resume();
    }

    /// 任务主循环, 在专属线程或池工作线程上阻塞执行
    pub fn run_loop(&self) {
        loop {
            let done = self.run_once();
            debug!("下载任务范围执行结束, 完整走完: {done}");
            if !self.wait_next_param() {
                break;
            }
        }
        let mut state = self.state.lock().unwrap();
        state.complete = true;
        info!("下载任务退出");
    }

    /// 执行一次当前范围的下载, 返回是否完整走完.
    ///
    /// 预载任务由池工作线程单次调用; 前台任务经 `run_loop` 反复调用.
    pub fn run_once(&self) -> bool {
        let (spec, sink) = {
            let state = self.state.lock().unwrap();
            if state.abort {
                return false;
            }
            (state.spec.clone(), state.sink.clone())
        };
        let Some(spec) = spec else {
            return false;
        };
        let Some(sink) = sink.and_then(|w| w.upgrade()) else {
            return false;
        };

        let result = self.downloader.run_download(&spec, &*sink);
        let done = result.is_ok();
        sink.finish(spec.serial, result);
        done
    }

    /// 等待下一组参数, 返回 false 表示任务应退出
    fn wait_next_param(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while !state.update && !state.abort {
            state = self.cond.wait(state).unwrap();
        }
        state.update = false;
        !state.abort
    }

    /// 中止任务: 唤醒等待、打断传输, 循环随即退出
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.abort = true;
            self.cond.notify_all();
        }
        self.downloader.abort();
        self.downloader.pause(true);
    }

    /// 暂停传输, `block` 为真时等待传输线程停驻
    pub fn pause(&self, block: bool) {
        self.downloader.pause(block);
    }

    /// 恢复传输
    pub fn resume(&self) {
        self.downloader.resume();
    }

    /// 清理传输现场: 停驻后立即恢复, 丢弃未消费的递交
    pub fn flush(&self) {
        self.downloader.pause(true);
        self.downloader.resume();
        let mut state = self.state.lock().unwrap();
        state.update = false;
    }

    /// 循环是否已退出
    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap().complete
    }

    /// 传输状态
    pub fn status(&self) -> Arc<DownloadStatus> {
        self.downloader.status()
    }
}
