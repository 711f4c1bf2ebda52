use crate::pipeline_index::PipelineIndex;
use ash::vk;

/// 工厂为某个组合生成的 pipeline
///
/// 只是句柄的拷贝，不负责销毁；所有权属于 pipeline cache。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pipeline {
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    index: PipelineIndex,
}
impl Pipeline {
    #[inline]
    pub fn new(handle: vk::Pipeline, layout: vk::PipelineLayout, index: PipelineIndex) -> Self {
        Self { handle, layout, index }
    }

    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    #[inline]
    pub fn index(&self) -> PipelineIndex {
        self.index
    }
}
