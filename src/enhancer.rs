//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 增强器契约
//!
//! 增强器包装一个底层后端，自身也是一个 [`CachingBackend`]，因此可以任意叠加。
//! 增强器订阅底层后端的事件，经过过滤/处理后重新发布：来源为底层后端
//! 自身的事件改记为增强器的 id，来自对端的事件保留原来源。

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::CachingBackend;
use crate::events::{BackendEvent, EventHub};

/// 增强器接口
pub trait CachingBackendEnhancer: CachingBackend {
    /// 被包装的后端
    fn underlying_backend(&self) -> &Arc<dyn CachingBackend>;
}

/// 事件转发任务
///
/// 从底层后端读取事件，交给 `handler` 处理；`handler` 返回 `Some` 时
/// 在 `hub` 上重新发布。没有 Tokio 运行时时不会转发任何事件。
pub struct EventRelay {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventRelay {
    pub fn start<F>(
        name: &'static str,
        source: &dyn CachingBackend,
        hub: Arc<EventHub>,
        handler: F,
    ) -> Self
    where
        F: Fn(BackendEvent) -> Option<BackendEvent> + Send + Sync + 'static,
    {
        let mut receiver = source.subscribe();
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            if let Some(event) = handler(event) {
                                hub.publish(event);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("{}: 事件转发滞后，丢弃了 {} 个事件", name, skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                debug!("{}: 事件转发任务结束", name);
            })),
            Err(_) => {
                warn!("{}: 未检测到Tokio运行时，底层事件不会被转发", name);
                None
            }
        };

        Self {
            handle: Mutex::new(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// 停止转发
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for EventRelay {
    fn drop(&mut self) {
        self.stop();
    }
}
