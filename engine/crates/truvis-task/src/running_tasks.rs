use slotmap::{SlotMap, new_key_type};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

new_key_type! { pub struct RunningTaskIndex; }

/// 运行中任务的登记表
///
/// 任务在构造时登记，在销毁前注销（通过 `RunningTaskGuard` 的 Drop 保证）。
/// 拥有者（例如窗口）在销毁时用 `wait_idle` 确认所有异步工作都已经结束。
///
/// 每个拥有者持有自己的 tracker，不使用全局状态。
pub struct RunningTasksTracker {
    tasks: Mutex<SlotMap<RunningTaskIndex, String>>,
    idle: Condvar,
}
// new & init
impl RunningTasksTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(SlotMap::with_key()),
            idle: Condvar::new(),
        })
    }
}
// register
impl RunningTasksTracker {
    /// 登记一个任务，返回的 guard 被 drop 时自动注销
    pub fn add(self: &Arc<Self>, name: impl Into<String>) -> RunningTaskGuard {
        let name = name.into();
        let index = self.lock_tasks().insert(name);
        RunningTaskGuard {
            tracker: self.clone(),
            index: Some(index),
        }
    }

    fn remove(&self, index: RunningTaskIndex) {
        let mut tasks = self.lock_tasks();
        if let Some(name) = tasks.remove(index) {
            log::debug!("running task `{}` booked out, {} remaining", name, tasks.len());
        }
        if tasks.is_empty() {
            self.idle.notify_all();
        }
    }
}
// getters
impl RunningTasksTracker {
    #[inline]
    pub fn len(&self) -> usize {
        self.lock_tasks().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lock_tasks().is_empty()
    }

    pub fn running_task_names(&self) -> Vec<String> {
        self.lock_tasks().values().cloned().collect()
    }

    /// 阻塞等待所有任务注销，超时返回 false
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let tasks = self.lock_tasks();
        let (tasks, _) = self
            .idle
            .wait_timeout_while(tasks, timeout, |tasks| !tasks.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        tasks.is_empty()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, SlotMap<RunningTaskIndex, String>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 任务在 tracker 中的登记凭证
pub struct RunningTaskGuard {
    tracker: Arc<RunningTasksTracker>,
    index: Option<RunningTaskIndex>,
}
impl RunningTaskGuard {
    /// 立即注销
    pub fn release(mut self) {
        self.release_mut();
    }

    fn release_mut(&mut self) {
        if let Some(index) = self.index.take() {
            self.tracker.remove(index);
        }
    }
}
impl Drop for RunningTaskGuard {
    fn drop(&mut self) {
        self.release_mut();
    }
}
