//! 常用的 characteristic

use crate::characteristic::{Characteristic, CharacteristicContext, CharacteristicRange, IndexRange};
use crate::error::{PipelineFactoryError, PipelineResult};
use crate::flat_create_info::{FlatCreateInfo, ShaderStage};
use ash::vk;

/// 所有组合共享的 shader、layout 和 push constant
pub struct ShaderProgram {
    pub name: String,
    pub stages: Vec<ShaderStage>,
    pub layout: vk::PipelineLayout,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
}
impl Characteristic for ShaderProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self, flat_create_info: &mut FlatCreateInfo, _context: &CharacteristicContext) -> PipelineResult<()> {
        if self.layout == vk::PipelineLayout::null() {
            return Err(PipelineFactoryError::CharacteristicInitialization {
                characteristic: self.name.clone(),
                reason: "pipeline layout is null".to_string(),
            });
        }

        for stage in &self.stages {
            flat_create_info.shader_stage(stage.clone());
        }
        for range in &self.push_constant_ranges {
            flat_create_info.insert_push_constant_range(*range)?;
        }
        flat_create_info.pipeline_layout(self.layout);
        Ok(())
    }
}

/// 使用帧配置中的 color / depth / stencil 格式和采样数
pub struct FrameAttachments {
    pub color_attachment_count: usize,
    pub depth: bool,
}
impl Characteristic for FrameAttachments {
    fn name(&self) -> &str {
        "frame-attachments"
    }

    fn initialize(&self, flat_create_info: &mut FlatCreateInfo, context: &CharacteristicContext) -> PipelineResult<()> {
        let frame = context.frame_settings;
        let stencil_format = (frame.stencil_format != vk::Format::UNDEFINED).then_some(frame.stencil_format);

        flat_create_info
            .attach_info(
                vec![frame.color_format; self.color_attachment_count],
                self.depth.then_some(frame.depth_format),
                stencil_format,
            )
            .msaa_sample(frame.sample_count)
            .color_blend(
                vec![BlendMode::Opaque.attachment_state(); self.color_attachment_count],
                [0.0; 4],
            );
        if !self.depth {
            flat_create_info.depth_test(None, false);
        }
        Ok(())
    }
}

/// 图元拓扑，每个取值对应列表中的一项
///
/// 一条 pipeline 只有一个拓扑，所以名字固定，同一个工厂只能注册一次。
pub struct TopologyRange {
    topologies: Vec<vk::PrimitiveTopology>,
}
impl TopologyRange {
    /// # Panics
    /// `topologies` 为空
    pub fn new(topologies: Vec<vk::PrimitiveTopology>) -> Self {
        assert!(!topologies.is_empty(), "TopologyRange requires at least one topology");
        Self { topologies }
    }
}
impl CharacteristicRange for TopologyRange {
    fn name(&self) -> &str {
        "topology"
    }

    fn range(&self) -> IndexRange {
        IndexRange::new(0, self.topologies.len() as i32)
    }

    fn initialize(&self, _: &mut FlatCreateInfo, _: &CharacteristicContext) -> PipelineResult<()> {
        Ok(())
    }

    fn fill(&self, flat_create_info: &mut FlatCreateInfo, index: i32) {
        flat_create_info.primitive_topology(self.topologies[index as usize]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Opaque,
    AlphaBlend,
    Additive,
}
impl BlendMode {
    pub fn attachment_state(self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::default().color_write_mask(vk::ColorComponentFlags::RGBA);
        match self {
            BlendMode::Opaque => state.blend_enable(false),
            BlendMode::AlphaBlend => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD),
            BlendMode::Additive => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE)
                .alpha_blend_op(vk::BlendOp::ADD),
        }
    }
}

/// 某一个 color attachment 的混合模式
///
/// 名字包含 attachment 序号，同一个工厂可以为每个 attachment 注册一个。
pub struct BlendModeRange {
    name: String,
    attachment: usize,
    modes: Vec<BlendMode>,
}
impl BlendModeRange {
    /// # Panics
    /// `modes` 为空
    pub fn new(attachment: usize, modes: Vec<BlendMode>) -> Self {
        assert!(!modes.is_empty(), "BlendModeRange requires at least one mode");
        Self {
            name: format!("blend-mode-{attachment}"),
            attachment,
            modes,
        }
    }
}
impl CharacteristicRange for BlendModeRange {
    fn name(&self) -> &str {
        &self.name
    }

    fn range(&self) -> IndexRange {
        IndexRange::new(0, self.modes.len() as i32)
    }

    fn initialize(&self, _: &mut FlatCreateInfo, _: &CharacteristicContext) -> PipelineResult<()> {
        Ok(())
    }

    fn fill(&self, flat_create_info: &mut FlatCreateInfo, index: i32) {
        flat_create_info.attachment_blend(self.attachment, self.modes[index as usize].attachment_state());
    }
}

/// 特化常量，取值就是常量的值
pub struct SpecializationConstantRange {
    name: String,
    stage: vk::ShaderStageFlags,
    constant_id: u32,
    range: IndexRange,
}
impl SpecializationConstantRange {
    pub fn new(name: impl Into<String>, stage: vk::ShaderStageFlags, constant_id: u32, range: IndexRange) -> Self {
        Self {
            name: name.into(),
            stage,
            constant_id,
            range,
        }
    }
}
impl CharacteristicRange for SpecializationConstantRange {
    fn name(&self) -> &str {
        &self.name
    }

    fn range(&self) -> IndexRange {
        self.range
    }

    fn initialize(&self, _: &mut FlatCreateInfo, _: &CharacteristicContext) -> PipelineResult<()> {
        Ok(())
    }

    fn fill(&self, flat_create_info: &mut FlatCreateInfo, index: i32) {
        flat_create_info.specialization_constant(self.stage, self.constant_id, index as u32);
    }
}
