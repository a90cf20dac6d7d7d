//! 缓存服务注册表
//!
//! 显式持有默认后端和命名后端，由调用方创建并传递，统一关闭。

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::backend::CachingBackend;
use crate::config::CachingConfig;
use crate::error::{CacheError, CacheResult};
use crate::memory::MemoryCachingBackend;
use crate::non_blocking::NonBlockingCachingBackendEnhancer;
use crate::two_layer::TwoLayerCachingBackendEnhancer;

/// 缓存服务注册表
pub struct CachingServices {
    default_backend: Arc<dyn CachingBackend>,
    backends: Mutex<HashMap<String, Arc<dyn CachingBackend>>>,
    shut_down: AtomicBool,
}

impl CachingServices {
    /// 以指定后端作为默认后端
    pub fn init(backend: Arc<dyn CachingBackend>) -> Self {
        info!("初始化缓存服务: default={}", backend.id());
        Self {
            default_backend: backend,
            backends: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// 按配置构建后端栈并作为默认后端
    ///
    /// 配置了 `two_layer` 时必须提供 `remote`。
    pub fn from_config(
        config: &CachingConfig,
        remote: Option<Arc<dyn CachingBackend>>,
    ) -> CacheResult<Self> {
        Ok(Self::init(build_backend(config, remote)?))
    }

    pub fn default_backend(&self) -> Arc<dyn CachingBackend> {
        Arc::clone(&self.default_backend)
    }

    /// 注册命名后端，返回被替换的旧后端
    pub fn register(
        &self,
        name: &str,
        backend: Arc<dyn CachingBackend>,
    ) -> CacheResult<Option<Arc<dyn CachingBackend>>> {
        if self.is_shut_down() {
            return Err(CacheError::Disposed("缓存服务".to_string()));
        }
        info!("注册缓存后端: name={}, id={}", name, backend.id());
        Ok(self.backends.lock().insert(name.to_string(), backend))
    }

    pub fn backend(&self, name: &str) -> Option<Arc<dyn CachingBackend>> {
        self.backends.lock().get(name).cloned()
    }

    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// 关闭所有后端，单个后端失败不影响其他后端，返回第一个错误。重复调用无副作用。
    pub async fn shutdown(&self) -> CacheResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut targets = vec![("default".to_string(), Arc::clone(&self.default_backend))];
        for (name, backend) in self.backends.lock().drain() {
            let duplicate = targets
                .iter()
                .any(|(_, existing)| same_backend(existing, &backend));
            if !duplicate {
                targets.push((name, backend));
            }
        }

        let mut first_error = None;
        for (name, backend) in targets {
            if let Err(e) = backend.shutdown().await {
                error!("关闭缓存后端失败: name={}, error={}", name, e);
                first_error.get_or_insert(e);
            }
        }

        info!("缓存服务已关闭");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn same_backend(a: &Arc<dyn CachingBackend>, b: &Arc<dyn CachingBackend>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// 按配置构建后端栈：内存 → 两级（可选）→ 非阻塞（可选）
pub fn build_backend(
    config: &CachingConfig,
    remote: Option<Arc<dyn CachingBackend>>,
) -> CacheResult<Arc<dyn CachingBackend>> {
    config.validate()?;

    let memory = MemoryCachingBackend::with_config(config.memory.to_backend_config());
    let mut backend: Arc<dyn CachingBackend> = match &config.two_layer {
        Some(section) => {
            let remote = remote.ok_or_else(|| {
                CacheError::ConfigError("两级缓存需要提供远端后端".to_string())
            })?;
            let remote: Arc<dyn CachingBackend> = if section.non_blocking_remote {
                Arc::new(NonBlockingCachingBackendEnhancer::new(remote)?)
            } else {
                remote
            };
            Arc::new(TwoLayerCachingBackendEnhancer::with_config(
                memory,
                remote,
                section.to_two_layer_config(),
            ))
        }
        None => Arc::new(memory),
    };

    if config.non_blocking {
        backend = Arc::new(NonBlockingCachingBackendEnhancer::new(backend)?);
    }

    Ok(backend)
}
