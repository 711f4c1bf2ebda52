use crate::compiler::PipelineCompiler;
use crate::error::{PipelineFactoryError, PipelineResult};
use crate::pipeline::Pipeline;
use crate::pipeline_index::PipelineIndex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// 组合索引 + build context 的内容 hash，精确匹配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineCacheKey {
    pub index: PipelineIndex,
    pub content_hash: u64,
}

/// `PipelineCache::store` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStore {
    Inserted,
    /// key 已经存在，先写入者胜出；调用者应当销毁自己的 pipeline 并使用这个
    Existing(Pipeline),
}

/// 多个工厂共享的 pipeline cache，内部同步
///
/// cache 拥有其中的 pipeline，写入后直到 cache 被清空前都不会被销毁。
pub trait PipelineCache: Send + Sync {
    fn name(&self) -> &str;

    fn lookup(&self, key: &PipelineCacheKey) -> Option<Pipeline>;

    fn store(&self, key: PipelineCacheKey, pipeline: Pipeline) -> CacheStore;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type CacheHandle = Arc<dyn PipelineCache>;

/// 工厂在 `Start` 状态通过它获取 cache
pub trait PipelineCacheProvider: Send + Sync {
    fn acquire_or_create(&self, name: &str) -> PipelineResult<CacheHandle>;
}

/// 内存中的 pipeline cache
pub struct MemoryPipelineCache {
    name: String,
    pipelines: RwLock<FxHashMap<PipelineCacheKey, Pipeline>>,
    hits: AtomicU64,
    misses: AtomicU64,
}
// new & init
impl MemoryPipelineCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipelines: RwLock::new(FxHashMap::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}
// getters
impl MemoryPipelineCache {
    #[inline]
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
// destroy
impl MemoryPipelineCache {
    /// 移出所有 pipeline，由调用者销毁
    pub fn drain(&self) -> Vec<Pipeline> {
        let mut pipelines = self.pipelines.write().unwrap_or_else(PoisonError::into_inner);
        pipelines.drain().map(|(_, pipeline)| pipeline).collect()
    }
}
impl PipelineCache for MemoryPipelineCache {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, key: &PipelineCacheKey) -> Option<Pipeline> {
        let pipeline = self
            .pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied();
        match pipeline {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        pipeline
    }

    fn store(&self, key: PipelineCacheKey, pipeline: Pipeline) -> CacheStore {
        let mut pipelines = self.pipelines.write().unwrap_or_else(PoisonError::into_inner);
        match pipelines.get(&key) {
            Some(existing) => CacheStore::Existing(*existing),
            None => {
                pipelines.insert(key, pipeline);
                CacheStore::Inserted
            }
        }
    }

    fn len(&self) -> usize {
        self.pipelines.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// 按名字管理 `MemoryPipelineCache`，同名的工厂共享同一个 cache
pub struct PipelineCacheRegistry {
    caches: Mutex<FxHashMap<String, Arc<MemoryPipelineCache>>>,
    /// 超出后 `acquire_or_create` 返回 `CacheUnavailable`
    max_caches: Option<usize>,
}
// new & init
impl PipelineCacheRegistry {
    pub fn new(max_caches: Option<usize>) -> Self {
        Self {
            caches: Mutex::new(FxHashMap::default()),
            max_caches,
        }
    }
}
// getters
impl PipelineCacheRegistry {
    pub fn get(&self, name: &str) -> Option<Arc<MemoryPipelineCache>> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }
}
// destroy
impl PipelineCacheRegistry {
    /// 销毁所有 cache 中的 pipeline，之后 registry 为空
    ///
    /// 必须在所有工厂结束之后调用。
    pub fn destroy(&self, compiler: &dyn PipelineCompiler) {
        let caches = std::mem::take(&mut *self.caches.lock().unwrap_or_else(PoisonError::into_inner));
        for (name, cache) in caches {
            let pipelines = cache.drain();
            log::info!("destroy pipeline cache `{}` with {} pipelines", name, pipelines.len());
            for pipeline in pipelines {
                compiler.destroy(pipeline);
            }
        }
    }
}
impl PipelineCacheProvider for PipelineCacheRegistry {
    fn acquire_or_create(&self, name: &str) -> PipelineResult<CacheHandle> {
        let mut caches = self.caches.lock().map_err(|_| PipelineFactoryError::CacheUnavailable {
            cache: name.to_string(),
            reason: "cache registry lock is poisoned".to_string(),
        })?;

        if let Some(cache) = caches.get(name) {
            let handle: CacheHandle = cache.clone();
            return Ok(handle);
        }
        if let Some(max_caches) = self.max_caches
            && caches.len() >= max_caches
        {
            return Err(PipelineFactoryError::CacheUnavailable {
                cache: name.to_string(),
                reason: format!("registry is limited to {max_caches} caches"),
            });
        }

        log::debug!("create pipeline cache `{}`", name);
        let cache = Arc::new(MemoryPipelineCache::new(name));
        caches.insert(name.to_string(), cache.clone());
        let handle: CacheHandle = cache;
        Ok(handle)
    }
}
