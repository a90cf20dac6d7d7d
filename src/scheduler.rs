//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 后台任务调度器
//!
//! 单消费者FIFO队列：所有任务按提交顺序由唯一的工作任务依次执行。
//! 任务失败或panic只会被计数和记录，不会传播给提交者。

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::DEFAULT_DISPOSE_TIMEOUT_SECS;
use crate::error::{CacheError, CacheResult};

/// 任务工厂：在工作任务中被调用，返回要执行的 future
pub type BackgroundTask = Box<dyn FnOnce() -> BoxFuture<'static, CacheResult<()>> + Send>;

enum SchedulerMessage {
    Task(BackgroundTask),
    Barrier(oneshot::Sender<()>),
}

/// 调度器统计信息
#[derive(Debug, Default)]
pub struct SchedulerStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SchedulerStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// 尚未执行完的任务数
    pub fn pending(&self) -> u64 {
        self.submitted()
            .saturating_sub(self.completed() + self.failed())
    }

    /// 最近一次失败的错误信息
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record_failure(&self, message: String) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(message);
    }
}

/// 后台任务调度器
pub struct BackgroundTaskScheduler {
    sender: Mutex<Option<mpsc::UnboundedSender<SchedulerMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
    stats: Arc<SchedulerStats>,
}

impl BackgroundTaskScheduler {
    /// 在当前Tokio运行时中创建调度器
    pub fn new() -> CacheResult<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            CacheError::ConfigError("后台任务调度器需要在Tokio运行时中创建".to_string())
        })?;
        Ok(Self::with_handle(runtime))
    }

    /// 在指定运行时上创建调度器
    pub fn with_handle(runtime: Handle) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(SchedulerStats::default());
        let worker = runtime.spawn(Self::worker_task(receiver, Arc::clone(&stats)));

        debug!("后台任务调度器已启动");

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            runtime,
            stats,
        }
    }

    async fn worker_task(
        mut receiver: mpsc::UnboundedReceiver<SchedulerMessage>,
        stats: Arc<SchedulerStats>,
    ) {
        while let Some(message) = receiver.recv().await {
            match message {
                SchedulerMessage::Task(factory) => {
                    let outcome = AssertUnwindSafe(async move { factory().await })
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Ok(())) => {
                            stats.completed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => {
                            error!("后台任务执行失败: {}", e);
                            stats.record_failure(e.to_string());
                        }
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            error!("后台任务panic: {}", message);
                            stats.record_failure(format!("panic: {}", message));
                        }
                    }
                }
                SchedulerMessage::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }

        info!("后台任务调度器工作任务结束");
    }

    /// 提交任务；调度器已停止时返回 [`CacheError::Disposed`]
    pub fn enqueue<F, Fut>(&self, factory: F) -> CacheResult<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<()>> + Send + 'static,
    {
        let task: BackgroundTask = Box::new(move || factory().boxed());
        self.send(SchedulerMessage::Task(task))?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send(&self, message: SchedulerMessage) -> CacheResult<()> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(CacheError::Disposed("后台任务调度器".to_string()));
        };
        sender
            .send(message)
            .map_err(|_| CacheError::Disposed("后台任务调度器".to_string()))
    }

    /// 等待此前提交的所有任务执行完毕，不停止调度器
    pub async fn drain(&self) -> CacheResult<()> {
        let (done, wait) = oneshot::channel();
        match self.send(SchedulerMessage::Barrier(done)) {
            Ok(()) => {
                // 工作任务已退出时 wait 会立即返回错误，此时队列也已处理完
                let _ = wait.await;
                Ok(())
            }
            Err(CacheError::Disposed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 停止接收新任务并等待队列处理完毕。重复调用无副作用。
    pub async fn shutdown(&self) -> CacheResult<()> {
        let Some(worker) = self.stop() else {
            return Ok(());
        };
        join_worker(worker).await
    }

    /// 可取消的关闭：取消时中止工作任务并丢弃剩余任务
    pub async fn shutdown_with(&self, cancel: &CancellationToken) -> CacheResult<()> {
        let Some(mut worker) = self.stop() else {
            return Ok(());
        };
        tokio::select! {
            result = &mut worker => map_join_result(result),
            _ = cancel.cancelled() => {
                worker.abort();
                warn!("后台任务调度器关闭被取消，剩余任务已丢弃");
                Err(CacheError::Cancelled)
            }
        }
    }

    /// 同步关闭
    ///
    /// 多线程运行时内使用 `block_in_place` 等待；运行时外阻塞在创建调度器时
    /// 捕获的多线程运行时上（带超时）。单线程运行时无法同步等待，返回
    /// `NotSupported` 且不停止调度器，调用方仍可使用 `shutdown().await`。
    pub fn dispose(&self) -> CacheResult<()> {
        if self.worker.lock().is_none() {
            return Ok(());
        }

        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                let Some(worker) = self.stop() else {
                    return Ok(());
                };
                tokio::task::block_in_place(|| current.block_on(join_worker(worker)))
            }
            Err(_) if self.runtime.runtime_flavor() == RuntimeFlavor::MultiThread => {
                let Some(worker) = self.stop() else {
                    return Ok(());
                };
                let timeout = Duration::from_secs(DEFAULT_DISPOSE_TIMEOUT_SECS);
                self.runtime
                    .block_on(async { tokio::time::timeout(timeout, join_worker(worker)).await })
                    .map_err(|_| {
                        CacheError::TaskError(format!(
                            "等待后台任务超时: {}秒",
                            DEFAULT_DISPOSE_TIMEOUT_SECS
                        ))
                    })?
            }
            _ => {
                warn!("单线程运行时中无法同步关闭后台任务调度器");
                Err(CacheError::NotSupported(
                    "同步关闭需要多线程运行时，请使用 shutdown().await".to_string(),
                ))
            }
        }
    }

    /// 是否仍在接收任务
    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// 关闭发送端，取出工作任务句柄
    fn stop(&self) -> Option<JoinHandle<()>> {
        let sender = self.sender.lock().take();
        if sender.is_some() {
            debug!(
                "后台任务调度器停止接收任务: pending={}",
                self.stats.pending()
            );
        }
        drop(sender);
        self.worker.lock().take()
    }
}

impl Drop for BackgroundTaskScheduler {
    fn drop(&mut self) {
        // 只关闭发送端，工作任务处理完剩余任务后自行退出
        self.sender.get_mut().take();
    }
}

async fn join_worker(worker: JoinHandle<()>) -> CacheResult<()> {
    map_join_result(worker.await)
}

fn map_join_result(result: Result<(), tokio::task::JoinError>) -> CacheResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(CacheError::TaskError(format!("后台任务调度器异常退出: {}", e))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知panic".to_string()
    }
}
