use crate::characteristic::{Characteristic, CharacteristicRange, Singleton};
use crate::compiler::PipelineCompiler;
use crate::error::{PipelineFactoryError, PipelineResult};
use crate::handles::{PipelineFactoryHandle, PipelineSlotHandle};
use crate::pipeline::Pipeline;
use crate::pipeline_cache::{CacheHandle, PipelineCacheProvider};
use crate::pipeline_factory::{
    FactoryEvent, PipelineFactory, PipelineFactoryContext, PipelineFactoryControl, PipelineFactoryReport,
    PipelineFactoryState,
};
use crate::pipeline_index::PipelineIndex;
use crate::pipeline_settings::PipelineHubSettings;
use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashMap;
use slotmap::SlotMap;
use std::sync::Arc;
use truvis_task::running_tasks::RunningTasksTracker;
use truvis_task::task_engine::TaskEngine;

/// 创建工厂的参数
#[derive(Clone, Debug)]
pub struct PipelineFactoryDesc {
    pub name: String,
    /// 同名的工厂共享同一个 cache
    pub cache_name: String,
    /// 生成的 pipeline 写入这个槽
    pub slot: PipelineSlotHandle,
}

#[derive(Clone, Debug)]
pub enum FactoryStatus {
    /// 已创建，还没有 start
    Created,
    Running,
    Finished(PipelineFactoryReport),
    Failed {
        error: PipelineFactoryError,
        report: PipelineFactoryReport,
    },
}

/// 调用者的结果槽：组合索引 -> pipeline
///
/// 只在渲染线程上通过 `PipelineHub::update` 写入。
#[derive(Default, Debug)]
pub struct PipelineSlot {
    pipelines: FxHashMap<PipelineIndex, Pipeline>,
    /// 累计收到的 pipeline 数量
    accepted: usize,
}
impl PipelineSlot {
    fn accept(&mut self, pipeline: Pipeline) {
        self.accepted += 1;
        if let Some(previous) = self.pipelines.insert(pipeline.index(), pipeline)
            && previous != pipeline
        {
            log::warn!("pipeline slot: pipeline {} replaced", pipeline.index());
        }
    }

    #[inline]
    pub fn get(&self, index: PipelineIndex) -> Option<Pipeline> {
        self.pipelines.get(&index).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    #[inline]
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn iter(&self) -> impl Iterator<Item = (PipelineIndex, Pipeline)> + '_ {
        self.pipelines.iter().map(|(&index, &pipeline)| (index, pipeline))
    }
}

/// `PipelineHub::update` 在这一帧处理的结果
#[derive(Debug, Default)]
pub struct HubUpdate {
    pub new_pipelines: usize,
    pub finished: Vec<PipelineFactoryHandle>,
}

struct PipelineFactoryEntry {
    control: PipelineFactoryControl,
    /// start 之前由 hub 持有
    pending_task: Option<PipelineFactory>,
    status: FactoryStatus,
    pipeline_cache: Option<CacheHandle>,
}

/// 管线工厂中心
///
/// 渲染线程上的协调者，拥有：
/// 1. 所有工厂和它们的状态
/// 2. 调用者的结果槽
/// 3. 运行中任务的 tracker，销毁前用来确认没有工厂还在运行
/// 4. 工厂到渲染线程的 channel，`update` 每帧把其中的 pipeline 写入结果槽
///
/// 每个 hub 都是独立的，不同的 hub 之间没有共享状态（共享的 cache provider 除外）。
pub struct PipelineHub {
    settings: PipelineHubSettings,
    task_engine: TaskEngine,
    compiler: Arc<dyn PipelineCompiler>,
    cache_provider: Arc<dyn PipelineCacheProvider>,
    running_tasks: Arc<RunningTasksTracker>,

    factories: SlotMap<PipelineFactoryHandle, PipelineFactoryEntry>,
    slots: SlotMap<PipelineSlotHandle, PipelineSlot>,

    event_sender: Sender<FactoryEvent>,
    event_receiver: Receiver<FactoryEvent>,

    shut_down: bool,
}
// new & init
impl PipelineHub {
    pub fn new(
        settings: PipelineHubSettings,
        compiler: Arc<dyn PipelineCompiler>,
        cache_provider: Arc<dyn PipelineCacheProvider>,
    ) -> anyhow::Result<Self> {
        let task_engine = TaskEngine::new(&settings.engine)?;
        log::info!("pipeline hub: {} factory workers", task_engine.worker_count());

        let (event_sender, event_receiver) = crossbeam_channel::unbounded();
        Ok(Self {
            settings,
            task_engine,
            compiler,
            cache_provider,
            running_tasks: RunningTasksTracker::new(),
            factories: SlotMap::with_key(),
            slots: SlotMap::with_key(),
            event_sender,
            event_receiver,
            shut_down: false,
        })
    }
}
// destroy
impl PipelineHub {
    /// 中止所有工厂，等待它们结束，然后处理剩余的事件
    ///
    /// 超时返回 false，此时仍有工厂在 worker 上运行。
    pub fn shutdown(&mut self) -> bool {
        if self.shut_down {
            return true;
        }

        for entry in self.factories.values_mut() {
            // 没有 start 的工厂直接 drop，guard 随之注销
            if entry.pending_task.take().is_some() {
                entry.status = FactoryStatus::Failed {
                    error: PipelineFactoryError::Aborted,
                    report: PipelineFactoryReport::default(),
                };
            }
            entry.control.abort();
        }

        let idle = self.running_tasks.wait_idle(self.settings.shutdown_timeout);
        if !idle {
            log::warn!(
                "pipeline hub: factories still running after {:?}: {:?}",
                self.settings.shutdown_timeout,
                self.running_tasks.running_task_names()
            );
        }
        self.update();

        self.shut_down = true;
        idle
    }
}
impl Drop for PipelineHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}
// register
impl PipelineHub {
    pub fn create_pipeline_slot(&mut self) -> PipelineSlotHandle {
        self.slots.insert(PipelineSlot::default())
    }

    /// 移除结果槽；写往这个槽的 pipeline 之后会被忽略（仍然保留在 cache 中）
    pub fn remove_pipeline_slot(&mut self, slot: PipelineSlotHandle) -> Option<PipelineSlot> {
        self.slots.remove(slot)
    }

    /// 创建工厂并登记到 tracker，但还不会运行
    pub fn create_pipeline_factory(&mut self, desc: PipelineFactoryDesc) -> PipelineResult<PipelineFactoryHandle> {
        if !self.slots.contains_key(desc.slot) {
            return Err(PipelineFactoryError::UnknownSlot);
        }

        let running_task = self.running_tasks.add(desc.name.clone());
        let handle = self.factories.insert_with_key(|handle| {
            let (factory, control) = PipelineFactory::new(
                desc.name,
                desc.cache_name,
                handle,
                desc.slot,
                PipelineFactoryContext {
                    frame_settings: self.settings.frame,
                    cache_provider: self.cache_provider.clone(),
                    compiler: self.compiler.clone(),
                    events: self.event_sender.clone(),
                },
                running_task,
            );
            PipelineFactoryEntry {
                control,
                pending_task: Some(factory),
                status: FactoryStatus::Created,
                pipeline_cache: None,
            }
        });
        Ok(handle)
    }

    pub fn add_characteristic(
        &mut self,
        factory: PipelineFactoryHandle,
        characteristic: Arc<dyn CharacteristicRange>,
    ) -> PipelineResult<()> {
        let entry = self.factories.get(factory).ok_or(PipelineFactoryError::UnknownFactory)?;
        entry.control.add_characteristic(characteristic)
    }

    pub fn add_singleton<C: Characteristic + 'static>(
        &mut self,
        factory: PipelineFactoryHandle,
        characteristic: C,
    ) -> PipelineResult<()> {
        self.add_characteristic(factory, Arc::new(Singleton(characteristic)))
    }
}
// tools
impl PipelineHub {
    pub fn start(&mut self, factory: PipelineFactoryHandle) -> PipelineResult<()> {
        let entry = self.factories.get_mut(factory).ok_or(PipelineFactoryError::UnknownFactory)?;
        let task = entry
            .pending_task
            .take()
            .ok_or_else(|| PipelineFactoryError::AlreadyStarted(entry.control.name().to_string()))?;

        log::info!("pipeline hub: start factory `{}`", entry.control.name());
        entry.control.attach(self.task_engine.run(task, PipelineFactoryState::Start));
        entry.status = FactoryStatus::Running;
        Ok(())
    }

    /// 所有 characteristic 已经注册，工厂开始生成 pipeline
    pub fn generate(&mut self, factory: PipelineFactoryHandle) -> PipelineResult<()> {
        let entry = self.factories.get(factory).ok_or(PipelineFactoryError::UnknownFactory)?;
        entry.control.signal_fully_initialized();
        Ok(())
    }

    /// 处理工厂发来的事件 (每帧调用)
    ///
    /// 1. 新生成的 pipeline 写入对应的结果槽
    /// 2. 结束的工厂更新状态，并保存它交出的 cache
    pub fn update(&mut self) -> HubUpdate {
        let mut update = HubUpdate::default();
        while let Ok(event) = self.event_receiver.try_recv() {
            match event {
                FactoryEvent::NewPipeline { slot, pipeline, .. } => match self.slots.get_mut(slot) {
                    Some(slot) => {
                        slot.accept(pipeline);
                        update.new_pipelines += 1;
                    }
                    None => log::warn!("pipeline {} arrived for a removed slot", pipeline.index()),
                },
                FactoryEvent::Finished {
                    factory,
                    report,
                    result,
                    pipeline_cache,
                } => {
                    let Some(entry) = self.factories.get_mut(factory) else {
                        log::debug!("pipeline hub: removed factory finished");
                        continue;
                    };
                    entry.status = match result {
                        Ok(()) => FactoryStatus::Finished(report),
                        Err(error) => FactoryStatus::Failed { error, report },
                    };
                    entry.pipeline_cache = pipeline_cache;
                    update.finished.push(factory);
                }
            }
        }
        update
    }

    /// 取走结束的工厂持有的 cache
    pub fn detach_pipeline_cache(&mut self, factory: PipelineFactoryHandle) -> Option<CacheHandle> {
        self.factories.get_mut(factory)?.pipeline_cache.take()
    }

    /// 移除工厂；仍在运行的工厂会被中止
    ///
    /// 只有已经结束的工厂才会返回它交出的 cache。运行中的工厂之后才发来的 cache
    /// 会被直接丢弃，无法通过这里取回，它仍然由 cache provider 持有。
    pub fn remove_factory(&mut self, factory: PipelineFactoryHandle) -> Option<CacheHandle> {
        let mut entry = self.factories.remove(factory)?;
        if matches!(entry.status, FactoryStatus::Running) {
            log::info!("pipeline hub: abort running factory `{}`", entry.control.name());
            entry.control.abort();
        }
        entry.pipeline_cache.take()
    }
}
// getters
impl PipelineHub {
    #[inline]
    pub fn settings(&self) -> &PipelineHubSettings {
        &self.settings
    }

    #[inline]
    pub fn factory_status(&self, factory: PipelineFactoryHandle) -> Option<&FactoryStatus> {
        self.factories.get(factory).map(|entry| &entry.status)
    }

    #[inline]
    pub fn pipeline_slot(&self, slot: PipelineSlotHandle) -> Option<&PipelineSlot> {
        self.slots.get(slot)
    }

    #[inline]
    pub fn pipeline(&self, slot: PipelineSlotHandle, index: PipelineIndex) -> Option<Pipeline> {
        self.slots.get(slot)?.get(index)
    }

    #[inline]
    pub fn running_task_count(&self) -> usize {
        self.running_tasks.len()
    }
}
