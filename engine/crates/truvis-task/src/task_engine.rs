use crate::stateful_task::{Condition, StatefulTask, TaskOutcome, TaskStep};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// 任务引擎配置
#[derive(Clone, Debug)]
pub struct TaskEngineSettings {
    /// worker 线程数量，0 表示使用 rayon 的默认值（CPU 核数）
    pub worker_threads: usize,
    pub thread_name_prefix: String,
}
impl Default for TaskEngineSettings {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            thread_name_prefix: "Task-Worker".to_string(),
        }
    }
}

/// 协作式任务引擎
///
/// ## 架构设计
/// - rayon 提供 worker 线程池，任务的每一次执行都是线程池中的一个 job
/// - 任务挂起（`TaskStep::Wait`）时 job 直接返回，worker 被归还给线程池
/// - `TaskHandle::signal` 唤醒挂起的任务，重新提交到线程池
/// - 同一个任务同一时刻最多只有一个 job 在执行（`scheduled` 标记 + body 锁）
/// - `multiplex` 中的 panic 被当作中止处理，任务仍然会收到 `finish(TaskOutcome::Aborted)`
pub struct TaskEngine {
    pool: Arc<rayon::ThreadPool>,
}
// new & init
impl TaskEngine {
    pub fn new(settings: &TaskEngineSettings) -> anyhow::Result<Self> {
        let prefix = settings.thread_name_prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.worker_threads)
            .thread_name(move |index| format!("{prefix}-{index}"))
            .panic_handler(|payload| log::error!("task worker panicked: {}", panic_message(payload.as_ref())))
            .build()?;

        Ok(Self { pool: Arc::new(pool) })
    }
}
// tools
impl TaskEngine {
    /// 从 `initial_state` 开始运行任务，立即返回
    pub fn run<T: StatefulTask>(&self, task: T, initial_state: T::State) -> TaskHandle {
        let name = task.task_name().to_string();
        log::debug!("run task `{}` from state {:?}", name, initial_state);

        let core = Arc::new(TaskCore {
            name,
            pool: self.pool.clone(),
            control: Mutex::new(TaskControl {
                scheduled: true,
                ..Default::default()
            }),
            body: Mutex::new(TaskBody {
                task,
                state: initial_state,
            }),
        });
        TaskCore::schedule(core.clone());

        TaskHandle { core }
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// 运行中任务的句柄，可以在任意线程上 signal 或 abort
#[derive(Clone)]
pub struct TaskHandle {
    core: Arc<dyn TaskCoreDyn>,
}
impl TaskHandle {
    /// 设置条件；如果任务正在等待这个条件，则重新调度它
    #[inline]
    pub fn signal(&self, condition: Condition) {
        self.core.clone().signal(condition);
    }

    /// 请求中止任务
    ///
    /// 正在执行的 `multiplex` 不会被打断，中止发生在下一个状态边界。
    #[inline]
    pub fn abort(&self) {
        self.core.clone().abort();
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.core.is_finished()
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.core.name()
    }
}
impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[derive(Default)]
struct TaskControl {
    /// 已经 signal 但还没有被消费的条件
    pending: u32,
    /// 任务挂起时等待的条件
    waiting: Option<Condition>,
    /// 任务已经被提交到线程池（或正在执行）
    scheduled: bool,
    abort_requested: bool,
    finished: bool,
}

struct TaskBody<T: StatefulTask> {
    task: T,
    state: T::State,
}

struct TaskCore<T: StatefulTask> {
    name: String,
    pool: Arc<rayon::ThreadPool>,
    control: Mutex<TaskControl>,
    body: Mutex<TaskBody<T>>,
}

trait TaskCoreDyn: Send + Sync {
    fn signal(self: Arc<Self>, condition: Condition);
    fn abort(self: Arc<Self>);
    fn is_finished(&self) -> bool;
    fn name(&self) -> &str;
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl<T: StatefulTask> TaskCore<T> {
    fn schedule(core: Arc<Self>) {
        let pool = core.pool.clone();
        pool.spawn(move || core.execute());
    }

    fn execute(self: Arc<Self>) {
        let mut body = lock(&self.body);
        loop {
            if lock(&self.control).abort_requested {
                self.complete(&mut body, TaskOutcome::Aborted);
                return;
            }

            let state = body.state;
            let step = match std::panic::catch_unwind(AssertUnwindSafe(|| body.task.multiplex(state))) {
                Ok(step) => step,
                Err(payload) => {
                    log::error!(
                        "task `{}` panicked in state {:?}: {}",
                        self.name,
                        state,
                        panic_message(payload.as_ref())
                    );
                    self.complete(&mut body, TaskOutcome::Aborted);
                    return;
                }
            };
            match step {
                TaskStep::Continue(next) => body.state = next,
                TaskStep::Yield(next) => {
                    body.state = next;
                    drop(body);
                    Self::schedule(self);
                    return;
                }
                TaskStep::Wait(next, condition) => {
                    body.state = next;

                    let mut control = lock(&self.control);
                    if control.pending & condition.bits() != 0 {
                        control.pending &= !condition.bits();
                        continue;
                    }
                    if control.abort_requested {
                        continue;
                    }
                    control.waiting = Some(condition);
                    control.scheduled = false;
                    return;
                }
                TaskStep::Finish => {
                    self.complete(&mut body, TaskOutcome::Finished);
                    return;
                }
                TaskStep::Abort => {
                    self.complete(&mut body, TaskOutcome::Aborted);
                    return;
                }
            }
        }
    }

    fn complete(&self, body: &mut TaskBody<T>, outcome: TaskOutcome) {
        log::debug!("task `{}` {:?} in state {:?}", self.name, outcome, body.state);
        body.task.finish(outcome);

        let mut control = lock(&self.control);
        control.finished = true;
        control.scheduled = false;
        control.waiting = None;
    }
}

impl<T: StatefulTask> TaskCoreDyn for TaskCore<T> {
    fn signal(self: Arc<Self>, condition: Condition) {
        let wake = {
            let mut control = lock(&self.control);
            if control.finished {
                return;
            }
            control.pending |= condition.bits();
            match control.waiting {
                Some(waiting) if !control.scheduled && waiting.bits() & condition.bits() != 0 => {
                    control.pending &= !waiting.bits();
                    control.waiting = None;
                    control.scheduled = true;
                    true
                }
                _ => false,
            }
        };
        if wake {
            Self::schedule(self);
        }
    }

    fn abort(self: Arc<Self>) {
        let wake = {
            let mut control = lock(&self.control);
            if control.finished || control.abort_requested {
                return;
            }
            control.abort_requested = true;
            if control.scheduled {
                false
            } else {
                control.waiting = None;
                control.scheduled = true;
                true
            }
        };
        if wake {
            log::debug!("abort waiting task `{}`", self.name);
            Self::schedule(self);
        }
    }

    fn is_finished(&self) -> bool {
        lock(&self.control).finished
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Sender;
    use std::time::Duration;

    const WAKEUP: Condition = Condition::new(1);

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum CountState {
        Count,
        Done,
    }

    struct CountTask {
        remaining: u32,
        visited: u32,
        done_tx: Sender<(u32, TaskOutcome)>,
    }
    impl StatefulTask for CountTask {
        type State = CountState;

        fn task_name(&self) -> &str {
            "CountTask"
        }

        fn multiplex(&mut self, state: CountState) -> TaskStep<CountState> {
            match state {
                CountState::Count => {
                    self.visited += 1;
                    self.remaining -= 1;
                    if self.remaining == 0 {
                        TaskStep::Continue(CountState::Done)
                    } else {
                        TaskStep::Yield(CountState::Count)
                    }
                }
                CountState::Done => TaskStep::Finish,
            }
        }

        fn finish(&mut self, outcome: TaskOutcome) {
            let _ = self.done_tx.send((self.visited, outcome));
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum WaitState {
        Wait,
        Signaled,
    }

    struct WaitTask {
        done_tx: Sender<(u32, TaskOutcome)>,
        wakeups: u32,
    }
    impl StatefulTask for WaitTask {
        type State = WaitState;

        fn task_name(&self) -> &str {
            "WaitTask"
        }

        fn multiplex(&mut self, state: WaitState) -> TaskStep<WaitState> {
            match state {
                WaitState::Wait => TaskStep::Wait(WaitState::Signaled, WAKEUP),
                WaitState::Signaled => {
                    self.wakeups += 1;
                    TaskStep::Finish
                }
            }
        }

        fn finish(&mut self, outcome: TaskOutcome) {
            let _ = self.done_tx.send((self.wakeups, outcome));
        }
    }

    struct PanicTask {
        done_tx: Sender<(u32, TaskOutcome)>,
    }
    impl StatefulTask for PanicTask {
        type State = CountState;

        fn task_name(&self) -> &str {
            "PanicTask"
        }

        fn multiplex(&mut self, _state: CountState) -> TaskStep<CountState> {
            panic!("broken state");
        }

        fn finish(&mut self, outcome: TaskOutcome) {
            let _ = self.done_tx.send((0, outcome));
        }
    }

    fn engine() -> TaskEngine {
        TaskEngine::new(&TaskEngineSettings {
            worker_threads: 2,
            thread_name_prefix: "Test-Worker".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_yielding_task_runs_to_completion() {
        let engine = engine();
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = engine.run(
            CountTask {
                remaining: 16,
                visited: 0,
                done_tx: tx,
            },
            CountState::Count,
        );

        let (visited, outcome) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(visited, 16);
        assert_eq!(outcome, TaskOutcome::Finished);
        // finish() 先于 finished 标记，稍等片刻
        std::thread::sleep(Duration::from_millis(10));
        assert!(handle.is_finished());
    }

    #[test]
    fn test_signal_wakes_waiting_task() {
        let engine = engine();
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = engine.run(WaitTask { done_tx: tx, wakeups: 0 }, WaitState::Wait);

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        handle.signal(WAKEUP);

        let (wakeups, outcome) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(wakeups, 1);
        assert_eq!(outcome, TaskOutcome::Finished);
    }

    #[test]
    fn test_signal_before_wait_is_not_lost() {
        let engine = engine();
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = engine.run(WaitTask { done_tx: tx, wakeups: 0 }, WaitState::Wait);
        // 无论 signal 发生在 Wait 之前还是之后，任务都必须被唤醒
        handle.signal(WAKEUP);

        let (_, outcome) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, TaskOutcome::Finished);
    }

    #[test]
    fn test_abort_waiting_task() {
        let engine = engine();
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = engine.run(WaitTask { done_tx: tx, wakeups: 0 }, WaitState::Wait);

        std::thread::sleep(Duration::from_millis(20));
        handle.abort();

        let (wakeups, outcome) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(wakeups, 0);
        assert_eq!(outcome, TaskOutcome::Aborted);

        // 已结束的任务忽略后续的 signal
        handle.signal(WAKEUP);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_panicking_task_is_aborted() {
        let engine = engine();
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = engine.run(PanicTask { done_tx: tx.clone() }, CountState::Count);

        let (_, outcome) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, TaskOutcome::Aborted);
        std::thread::sleep(Duration::from_millis(10));
        assert!(handle.is_finished());

        // worker 仍然可用
        engine.run(
            CountTask {
                remaining: 2,
                visited: 0,
                done_tx: tx,
            },
            CountState::Count,
        );
        let (visited, outcome) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(visited, 2);
        assert_eq!(outcome, TaskOutcome::Finished);
    }
}
