use std::fmt::Debug;

/// 任务等待的条件位
///
/// 一个 `Condition` 可以包含多个位，任意一位被 signal 即唤醒等待它的任务。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Condition(u32);
impl Condition {
    #[inline]
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// `multiplex` 的返回值，决定任务接下来如何被调度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStep<S> {
    /// 切换到新状态，并在当前 worker 上立即继续执行
    Continue(S),
    /// 切换到新状态，然后把 worker 让给线程池中的其他任务
    Yield(S),
    /// 切换到新状态，然后挂起，直到条件被 signal
    ///
    /// 如果条件在此之前已经被 signal 过，则不会真正挂起。
    Wait(S, Condition),
    /// 正常结束
    Finish,
    /// 异常结束，失败原因由任务自己保存
    Abort,
}

/// 任务的最终结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished,
    /// 任务自己返回了 `TaskStep::Abort`，或者外部调用了 `TaskHandle::abort`
    Aborted,
}

/// 协作式状态机任务
///
/// 任务的每一个状态都在 `multiplex` 中处理。引擎保证同一个任务的 `multiplex`
/// 永远不会在两个 worker 上同时执行；不同任务之间可以并行。
///
/// 任务只能在状态边界处挂起（返回 `TaskStep::Wait`），挂起时不会占用 worker 线程。
pub trait StatefulTask: Send + 'static {
    type State: Copy + Debug + Send + 'static;

    fn task_name(&self) -> &str;

    fn multiplex(&mut self, state: Self::State) -> TaskStep<Self::State>;

    /// 任务结束时调用一次，无论是正常结束还是被中止
    fn finish(&mut self, _outcome: TaskOutcome) {}
}
