//! 管线工厂任务
//!
//! 一个工厂拥有一组 characteristic，在 worker 线程上逐个枚举它们的所有组合，
//! 为每个组合生成一条 pipeline，并通过 channel 交给渲染线程。
//!
//! ```text
//! Start ──► Initialize ◄──► Initialized ──► Generate ⟲ ──► Done
//! ```
//!
//! - `Start`: 获取共享的 pipeline cache
//! - `Initialize`: 对新注册的 characteristic 调用 `initialize`
//! - `Initialized`: 有新的 characteristic 时回到 `Initialize`；收到 `generate` 信号后进入 `Generate`；
//!   否则挂起等待 `FACTORY_WAKEUP`
//! - `Generate`: 每一步处理一个组合，然后让出 worker
//! - `Done`: 释放 characteristic，交出 cache

use crate::characteristic::{CharacteristicContext, CharacteristicRange};
use crate::compiler::PipelineCompiler;
use crate::error::{PipelineFactoryError, PipelineResult};
use crate::flat_create_info::FlatCreateInfo;
use crate::handles::{PipelineFactoryHandle, PipelineSlotHandle};
use crate::multi_loop::MultiLoop;
use crate::pipeline::Pipeline;
use crate::pipeline_cache::{CacheHandle, CacheStore, PipelineCacheKey, PipelineCacheProvider};
use crate::pipeline_index::{PipelineIndex, PipelineIndexLayout};
use crate::pipeline_settings::FrameSettings;
use crossbeam_channel::Sender;
use itertools::Itertools;
use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use truvis_task::running_tasks::RunningTaskGuard;
use truvis_task::stateful_task::{Condition, StatefulTask, TaskOutcome, TaskStep};
use truvis_task::task_engine::TaskHandle;

/// `add_characteristic` 和 `generate` 用来唤醒挂起的工厂
pub const FACTORY_WAKEUP: Condition = Condition::new(1 << 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineFactoryState {
    Start,
    Initialize,
    Initialized,
    Generate,
    Done,
}
impl fmt::Display for PipelineFactoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Initialize => "initialize",
            Self::Initialized => "initialized",
            Self::Generate => "generate",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// 工厂运行过程的记录，随 `FactoryEvent::Finished` 交给渲染线程
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineFactoryReport {
    /// 依次经过的状态，连续重复的状态只记录一次
    pub states: Vec<PipelineFactoryState>,
    /// 交给渲染线程的 pipeline 数量
    pub pipelines: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

/// 工厂发往渲染线程的消息
pub enum FactoryEvent {
    NewPipeline {
        factory: PipelineFactoryHandle,
        slot: PipelineSlotHandle,
        pipeline: Pipeline,
    },
    Finished {
        factory: PipelineFactoryHandle,
        report: PipelineFactoryReport,
        result: PipelineResult<()>,
        /// 工厂持有的 cache，由渲染线程决定是否 detach
        pipeline_cache: Option<CacheHandle>,
    },
}

/// 渲染线程和工厂任务之间共享的收件箱
#[derive(Default)]
struct FactoryInbox {
    /// 已经注册但还没有 initialize 的 characteristic
    pending: Vec<Arc<dyn CharacteristicRange>>,
    names: FxHashSet<String>,
    fully_initialized: bool,
    /// 注册阶段发生的致命错误，工厂下一次检查时中止
    failed: Option<PipelineFactoryError>,
}

fn lock_inbox(inbox: &Mutex<FactoryInbox>) -> MutexGuard<'_, FactoryInbox> {
    inbox.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 渲染线程一侧对工厂的控制
pub(crate) struct PipelineFactoryControl {
    name: String,
    inbox: Arc<Mutex<FactoryInbox>>,
    task: Option<TaskHandle>,
}
impl PipelineFactoryControl {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attach(&mut self, task: TaskHandle) {
        self.task = Some(task);
    }

    pub fn add_characteristic(&self, characteristic: Arc<dyn CharacteristicRange>) -> PipelineResult<()> {
        let name = characteristic.name().to_string();
        {
            let mut inbox = lock_inbox(&self.inbox);
            if inbox.fully_initialized {
                return Err(PipelineFactoryError::LateRegistration(name));
            }
            if !inbox.names.insert(name.clone()) {
                let err = PipelineFactoryError::DuplicateRegistration(name);
                inbox.failed.get_or_insert_with(|| err.clone());
                drop(inbox);
                self.wake();
                return Err(err);
            }

            log::debug!("factory `{}`: add characteristic `{}`", self.name, name);
            inbox.pending.push(characteristic);
        }
        self.wake();
        Ok(())
    }

    /// 所有 characteristic 都已经注册，可以开始生成
    pub fn signal_fully_initialized(&self) {
        lock_inbox(&self.inbox).fully_initialized = true;
        self.wake();
    }

    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    fn wake(&self) {
        if let Some(task) = &self.task {
            task.signal(FACTORY_WAKEUP);
        }
    }
}

/// 构造工厂需要的共享对象，由 `PipelineHub` 提供
pub(crate) struct PipelineFactoryContext {
    pub frame_settings: FrameSettings,
    pub cache_provider: Arc<dyn PipelineCacheProvider>,
    pub compiler: Arc<dyn PipelineCompiler>,
    pub events: Sender<FactoryEvent>,
}

pub struct PipelineFactory {
    name: String,
    handle: PipelineFactoryHandle,
    slot: PipelineSlotHandle,
    cache_name: String,

    frame_settings: FrameSettings,
    cache_provider: Arc<dyn PipelineCacheProvider>,
    compiler: Arc<dyn PipelineCompiler>,
    events: Sender<FactoryEvent>,
    inbox: Arc<Mutex<FactoryInbox>>,
    running_task: Option<RunningTaskGuard>,

    /// 按注册顺序排列
    characteristics: Vec<Arc<dyn CharacteristicRange>>,
    pipeline_cache: Option<CacheHandle>,
    /// 所有 characteristic 初始化之后的基础状态，每个组合拷贝一份
    flat_create_info: Option<FlatCreateInfo>,
    index_layout: Option<PipelineIndexLayout>,
    range_counters: Option<MultiLoop>,
    generated: FxHashSet<PipelineIndex>,

    report: PipelineFactoryReport,
    error: Option<PipelineFactoryError>,
}
// new & init
impl PipelineFactory {
    pub(crate) fn new(
        name: String,
        cache_name: String,
        handle: PipelineFactoryHandle,
        slot: PipelineSlotHandle,
        context: PipelineFactoryContext,
        running_task: RunningTaskGuard,
    ) -> (Self, PipelineFactoryControl) {
        let inbox = Arc::new(Mutex::new(FactoryInbox::default()));
        let control = PipelineFactoryControl {
            name: name.clone(),
            inbox: inbox.clone(),
            task: None,
        };

        let factory = Self {
            name,
            handle,
            slot,
            cache_name,

            frame_settings: context.frame_settings,
            cache_provider: context.cache_provider,
            compiler: context.compiler,
            events: context.events,
            inbox,
            running_task: Some(running_task),

            characteristics: vec![],
            pipeline_cache: None,
            flat_create_info: None,
            index_layout: None,
            range_counters: None,
            generated: FxHashSet::default(),

            report: PipelineFactoryReport::default(),
            error: None,
        };
        (factory, control)
    }
}
// states
impl PipelineFactory {
    fn start(&mut self) -> PipelineResult<TaskStep<PipelineFactoryState>> {
        self.check_inbox_failure()?;

        let cache = self.cache_provider.acquire_or_create(&self.cache_name)?;
        log::debug!("factory `{}`: acquired pipeline cache `{}`", self.name, cache.name());
        self.pipeline_cache = Some(cache);

        Ok(TaskStep::Continue(PipelineFactoryState::Initialize))
    }

    fn initialize(&mut self) -> PipelineResult<TaskStep<PipelineFactoryState>> {
        let pending = {
            let mut inbox = lock_inbox(&self.inbox);
            if let Some(err) = &inbox.failed {
                return Err(err.clone());
            }
            std::mem::take(&mut inbox.pending)
        };

        let flat_create_info = self.flat_create_info.get_or_insert_with(FlatCreateInfo::default);
        let context = CharacteristicContext {
            factory_name: &self.name,
            frame_settings: &self.frame_settings,
        };
        for characteristic in pending {
            log::debug!("factory `{}`: initialize `{}`", self.name, characteristic.name());
            characteristic.initialize(flat_create_info, &context)?;
            self.characteristics.push(characteristic);
        }

        Ok(TaskStep::Continue(PipelineFactoryState::Initialized))
    }

    fn initialized(&mut self) -> PipelineResult<TaskStep<PipelineFactoryState>> {
        {
            let inbox = lock_inbox(&self.inbox);
            if let Some(err) = &inbox.failed {
                return Err(err.clone());
            }
            if !inbox.pending.is_empty() {
                return Ok(TaskStep::Continue(PipelineFactoryState::Initialize));
            }
            if !inbox.fully_initialized {
                return Ok(TaskStep::Wait(PipelineFactoryState::Initialized, FACTORY_WAKEUP));
            }
        }

        // 注册顺序从这里开始固定
        let ranges = self.characteristics.iter().map(|c| c.range()).collect_vec();
        let layout = PipelineIndexLayout::new(ranges)?;
        log::debug!(
            "factory `{}`: {} characteristics, {} combinations, {} index bits",
            self.name,
            self.characteristics.len(),
            layout.combination_count(),
            layout.total_bits()
        );
        self.range_counters = Some(MultiLoop::new(layout.ranges()));
        self.index_layout = Some(layout);

        Ok(TaskStep::Continue(PipelineFactoryState::Generate))
    }

    fn generate_one(&mut self) -> PipelineResult<TaskStep<PipelineFactoryState>> {
        let (Some(range_counters), Some(layout)) = (&self.range_counters, &self.index_layout) else {
            return Ok(TaskStep::Continue(PipelineFactoryState::Done));
        };
        if range_counters.finished() {
            return Ok(TaskStep::Continue(PipelineFactoryState::Done));
        }

        // 1. 组合索引，2. 在基础状态的拷贝上 fill
        let mut pipeline_index = PipelineIndex::ZERO;
        let mut flat_create_info = self.flat_create_info.clone().unwrap_or_default();
        for ((characteristic, range), &value) in
            self.characteristics.iter().zip(layout.ranges()).zip(range_counters.current())
        {
            range
                .update(&mut pipeline_index, value)
                .map_err(|source| PipelineFactoryError::RangeViolation {
                    characteristic: characteristic.name().to_string(),
                    source,
                })?;
            if !characteristic.is_singleton() {
                characteristic.fill(&mut flat_create_info, value);
            }
        }
        assert!(
            self.generated.insert(pipeline_index),
            "factory `{}` generated pipeline {} twice",
            self.name,
            pipeline_index
        );

        // 3. 查找或创建
        let pipeline = self.lookup_or_compile(pipeline_index, &flat_create_info)?;

        // 4. 交给渲染线程
        log::debug!("factory `{}`: hand off pipeline {}", self.name, pipeline_index);
        self.events
            .send(FactoryEvent::NewPipeline {
                factory: self.handle,
                slot: self.slot,
                pipeline,
            })
            .map_err(|_| PipelineFactoryError::Aborted)?;
        self.report.pipelines += 1;

        if let Some(range_counters) = &mut self.range_counters {
            range_counters.advance();
        }
        Ok(TaskStep::Yield(PipelineFactoryState::Generate))
    }

    fn done(&mut self) -> PipelineResult<TaskStep<PipelineFactoryState>> {
        log::info!(
            "factory `{}` generated {} pipelines ({} cache hits, {} misses)",
            self.name,
            self.report.pipelines,
            self.report.cache_hits,
            self.report.cache_misses
        );
        Ok(TaskStep::Finish)
    }
}
// tools
impl PipelineFactory {
    fn check_inbox_failure(&self) -> PipelineResult<()> {
        match &lock_inbox(&self.inbox).failed {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn lookup_or_compile(
        &mut self,
        pipeline_index: PipelineIndex,
        flat_create_info: &FlatCreateInfo,
    ) -> PipelineResult<Pipeline> {
        let cache = self
            .pipeline_cache
            .as_ref()
            .ok_or_else(|| PipelineFactoryError::CacheUnavailable {
                cache: self.cache_name.clone(),
                reason: "the pipeline cache was released".to_string(),
            })?;
        let key = PipelineCacheKey {
            index: pipeline_index,
            content_hash: flat_create_info.content_hash(),
        };

        if let Some(pipeline) = cache.lookup(&key) {
            self.report.cache_hits += 1;
            return Ok(pipeline);
        }
        self.report.cache_misses += 1;

        let pipeline = self.compiler.compile(flat_create_info, pipeline_index).map_err(|err| {
            PipelineFactoryError::PipelineCreation {
                index: pipeline_index,
                reason: format!("{err:#}"),
            }
        })?;
        match cache.store(key, pipeline) {
            CacheStore::Inserted => Ok(pipeline),
            CacheStore::Existing(existing) => {
                log::warn!(
                    "factory `{}`: pipeline {} was stored concurrently in `{}`, drop the duplicate",
                    self.name,
                    pipeline_index,
                    cache.name()
                );
                self.compiler.destroy(pipeline);
                Ok(existing)
            }
        }
    }
}
impl StatefulTask for PipelineFactory {
    type State = PipelineFactoryState;

    fn task_name(&self) -> &str {
        &self.name
    }

    fn multiplex(&mut self, state: PipelineFactoryState) -> TaskStep<PipelineFactoryState> {
        if self.report.states.last() != Some(&state) {
            log::debug!("factory `{}` -> {}", self.name, state);
            self.report.states.push(state);
        }

        let step = match state {
            PipelineFactoryState::Start => self.start(),
            PipelineFactoryState::Initialize => self.initialize(),
            PipelineFactoryState::Initialized => self.initialized(),
            PipelineFactoryState::Generate => self.generate_one(),
            PipelineFactoryState::Done => self.done(),
        };
        step.unwrap_or_else(|err| {
            log::error!("factory `{}` failed in state {}: {}", self.name, state, err);
            self.error = Some(err);
            TaskStep::Abort
        })
    }

    fn finish(&mut self, outcome: TaskOutcome) {
        let result = match (self.error.take(), outcome) {
            (Some(err), _) => Err(err),
            (None, TaskOutcome::Finished) => Ok(()),
            (None, TaskOutcome::Aborted) => Err(PipelineFactoryError::Aborted),
        };

        self.characteristics.clear();
        self.flat_create_info = None;
        self.index_layout = None;
        self.range_counters = None;

        let _ = self.events.send(FactoryEvent::Finished {
            factory: self.handle,
            report: std::mem::take(&mut self.report),
            result,
            pipeline_cache: self.pipeline_cache.take(),
        });

        // 注销放在最后：tracker 变空时渲染线程已经能收到所有事件
        if let Some(running_task) = self.running_task.take() {
            running_task.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristic::IndexRange;
    use crate::pipeline_cache::PipelineCacheRegistry;
    use ash::vk;
    use ash::vk::Handle;
    use crossbeam_channel::Receiver;
    use slotmap::SlotMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use truvis_task::running_tasks::RunningTasksTracker;
    use truvis_task::task_engine::{TaskEngine, TaskEngineSettings};

    struct CountingCompiler {
        next_handle: AtomicU64,
    }
    impl PipelineCompiler for CountingCompiler {
        fn compile(&self, flat_create_info: &FlatCreateInfo, index: PipelineIndex) -> anyhow::Result<Pipeline> {
            let raw = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(Pipeline::new(vk::Pipeline::from_raw(raw), flat_create_info.layout(), index))
        }

        fn destroy(&self, _pipeline: Pipeline) {}
    }

    /// 用 line width 记录取值的 characteristic
    struct LineWidthRange {
        name: &'static str,
        range: IndexRange,
    }
    impl CharacteristicRange for LineWidthRange {
        fn name(&self) -> &str {
            self.name
        }

        fn range(&self) -> IndexRange {
            self.range
        }

        fn initialize(&self, _: &mut FlatCreateInfo, _: &CharacteristicContext) -> PipelineResult<()> {
            Ok(())
        }

        fn fill(&self, flat_create_info: &mut FlatCreateInfo, index: i32) {
            flat_create_info.set_line_width(index as f32 + 1.0);
        }
    }

    struct PanickingRange;
    impl CharacteristicRange for PanickingRange {
        fn name(&self) -> &str {
            "panicking"
        }

        fn range(&self) -> IndexRange {
            IndexRange::new(0, 2)
        }

        fn initialize(&self, _: &mut FlatCreateInfo, _: &CharacteristicContext) -> PipelineResult<()> {
            Ok(())
        }

        fn fill(&self, _: &mut FlatCreateInfo, index: i32) {
            assert!(index < 1, "value {index} is not supported");
        }
    }

    struct Fixture {
        engine: TaskEngine,
        tracker: Arc<RunningTasksTracker>,
        events: Receiver<FactoryEvent>,
        factory: PipelineFactory,
        control: PipelineFactoryControl,
    }

    fn fixture() -> Fixture {
        let engine = TaskEngine::new(&TaskEngineSettings {
            worker_threads: 2,
            thread_name_prefix: "Factory-Test".to_string(),
        })
        .unwrap();
        let tracker = RunningTasksTracker::new();
        let (sender, events) = crossbeam_channel::unbounded();

        let mut factories = SlotMap::<PipelineFactoryHandle, ()>::with_key();
        let mut slots = SlotMap::<PipelineSlotHandle, ()>::with_key();
        let (factory, control) = PipelineFactory::new(
            "test-factory".to_string(),
            "test-cache".to_string(),
            factories.insert(()),
            slots.insert(()),
            PipelineFactoryContext {
                frame_settings: FrameSettings::default(),
                cache_provider: Arc::new(PipelineCacheRegistry::new(None)),
                compiler: Arc::new(CountingCompiler {
                    next_handle: AtomicU64::new(0),
                }),
                events: sender,
            },
            tracker.add("test-factory"),
        );
        Fixture {
            engine,
            tracker,
            events,
            factory,
            control,
        }
    }

    /// 收集事件直到 Finished
    fn collect(events: &Receiver<FactoryEvent>) -> (Vec<Pipeline>, PipelineFactoryReport, PipelineResult<()>) {
        let mut pipelines = vec![];
        loop {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                FactoryEvent::NewPipeline { pipeline, .. } => pipelines.push(pipeline),
                FactoryEvent::Finished { report, result, .. } => return (pipelines, report, result),
            }
        }
    }

    #[test]
    fn test_factory_generates_every_combination() {
        let Fixture {
            engine,
            tracker,
            events,
            factory,
            mut control,
        } = fixture();

        control
            .add_characteristic(Arc::new(LineWidthRange {
                name: "width",
                range: IndexRange::new(0, 4),
            }))
            .unwrap();
        control.signal_fully_initialized();
        control.attach(engine.run(factory, PipelineFactoryState::Start));

        let (pipelines, report, result) = collect(&events);
        assert!(result.is_ok());
        assert_eq!(
            pipelines.iter().map(|p| p.index().raw()).collect_vec(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(
            report.states,
            vec![
                PipelineFactoryState::Start,
                PipelineFactoryState::Initialize,
                PipelineFactoryState::Initialized,
                PipelineFactoryState::Generate,
                PipelineFactoryState::Done,
            ]
        );
        assert_eq!(report.pipelines, 4);
        assert_eq!(report.cache_misses, 4);
        assert!(tracker.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_factory_waits_for_generate_signal() {
        let Fixture {
            engine,
            tracker,
            events,
            factory,
            mut control,
        } = fixture();
        control.attach(engine.run(factory, PipelineFactoryState::Start));

        // 没有 generate 信号时不会产生任何 pipeline
        assert!(events.recv_timeout(Duration::from_millis(50)).is_err());

        // 工厂挂起时也可以继续注册
        control
            .add_characteristic(Arc::new(LineWidthRange {
                name: "a",
                range: IndexRange::new(0, 2),
            }))
            .unwrap();
        control
            .add_characteristic(Arc::new(LineWidthRange {
                name: "b",
                range: IndexRange::new(0, 3),
            }))
            .unwrap();
        assert!(events.recv_timeout(Duration::from_millis(20)).is_err());

        control.signal_fully_initialized();
        let (pipelines, report, result) = collect(&events);
        assert!(result.is_ok());
        assert_eq!(pipelines.len(), 6);
        assert_eq!(report.states.first(), Some(&PipelineFactoryState::Start));
        assert_eq!(report.states.last(), Some(&PipelineFactoryState::Done));

        // 注册已经结束
        let err = control
            .add_characteristic(Arc::new(LineWidthRange {
                name: "late",
                range: IndexRange::new(0, 2),
            }))
            .unwrap_err();
        assert!(matches!(err, PipelineFactoryError::LateRegistration(ref name) if name == "late"));
        assert!(tracker.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_duplicate_registration_aborts_factory() {
        let Fixture {
            engine,
            tracker,
            events,
            factory,
            mut control,
        } = fixture();
        control.attach(engine.run(factory, PipelineFactoryState::Start));

        let characteristic = || {
            Arc::new(LineWidthRange {
                name: "twice",
                range: IndexRange::new(0, 2),
            })
        };
        control.add_characteristic(characteristic()).unwrap();
        let err = control.add_characteristic(characteristic()).unwrap_err();
        assert!(matches!(err, PipelineFactoryError::DuplicateRegistration(ref name) if name == "twice"));

        let (pipelines, _, result) = collect(&events);
        assert!(pipelines.is_empty());
        assert!(matches!(result, Err(PipelineFactoryError::DuplicateRegistration(_))));
        assert!(tracker.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_abort_waiting_factory_books_out() {
        let Fixture {
            engine,
            tracker,
            events,
            factory,
            mut control,
        } = fixture();
        control.attach(engine.run(factory, PipelineFactoryState::Start));
        assert_eq!(tracker.len(), 1);

        std::thread::sleep(Duration::from_millis(20));
        control.abort();

        let (pipelines, _, result) = collect(&events);
        assert!(pipelines.is_empty());
        assert!(matches!(result, Err(PipelineFactoryError::Aborted)));
        assert!(tracker.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_zero_characteristics_generate_one_pipeline() {
        let Fixture {
            engine,
            events,
            factory,
            mut control,
            ..
        } = fixture();
        control.signal_fully_initialized();
        control.attach(engine.run(factory, PipelineFactoryState::Start));

        let (pipelines, report, result) = collect(&events);
        assert!(result.is_ok());
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].index(), PipelineIndex::ZERO);
        assert_eq!(report.pipelines, 1);
    }

    #[test]
    fn test_panic_in_fill_aborts_factory() {
        let Fixture {
            engine,
            tracker,
            events,
            factory,
            mut control,
        } = fixture();
        control.add_characteristic(Arc::new(PanickingRange)).unwrap();
        control.signal_fully_initialized();
        control.attach(engine.run(factory, PipelineFactoryState::Start));

        // 第一个组合正常交出，第二个组合 panic
        let (pipelines, report, result) = collect(&events);
        assert_eq!(pipelines.len(), 1);
        assert_eq!(report.pipelines, 1);
        assert!(matches!(result, Err(PipelineFactoryError::Aborted)));
        assert!(tracker.wait_idle(Duration::from_secs(5)));
    }
}
