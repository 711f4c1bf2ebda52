use crate::error::{PipelineFactoryError, PipelineResult};
use ash::vk;
use rustc_hash::FxHasher;
use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::hash::{Hash, Hasher};

/// 一个 shader stage：module 由调用者创建并负责销毁
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry_point: CString,
}
impl ShaderStage {
    pub fn new(stage: vk::ShaderStageFlags, module: vk::ShaderModule, entry_point: &CStr) -> Self {
        Self {
            stage,
            module,
            entry_point: entry_point.to_owned(),
        }
    }
}

/// 创建一条 graphics pipeline 所需的全部信息
///
/// 只包含 `vk` 中的纯值类型，不含任何指针，可以跨线程移动和 clone。
/// 真正的 `vk::GraphicsPipelineCreateInfo` 在 `PipelineCompiler` 中临时组装。
#[derive(Clone, Debug)]
pub struct FlatCreateInfo {
    shader_stages: Vec<ShaderStage>,
    /// (stage flags, constant id) -> value
    specialization_constants: BTreeMap<(u32, u32), u32>,

    vertex_binding_desc: Vec<vk::VertexInputBindingDescription>,
    vertex_attribute_desc: Vec<vk::VertexInputAttributeDescription>,

    primitive_topology: vk::PrimitiveTopology,

    polygon_mode: vk::PolygonMode,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    line_width: f32,

    msaa_sample: vk::SampleCountFlags,

    /// dynamic render 需要的 framebuffer 信息
    color_attach_formats: Vec<vk::Format>,
    depth_attach_format: vk::Format,
    stencil_attach_format: vk::Format,

    depth_test_enable: bool,
    depth_write_enable: bool,
    depth_compare_op: vk::CompareOp,

    color_attach_blend_states: Vec<vk::PipelineColorBlendAttachmentState>,
    blend_constants: [f32; 4],

    dynamic_states: Vec<vk::DynamicState>,

    /// 按 stage flags 排序，stage 互不相交
    push_constant_ranges: Vec<vk::PushConstantRange>,
    pipeline_layout: vk::PipelineLayout,
}
impl Default for FlatCreateInfo {
    fn default() -> Self {
        Self {
            shader_stages: vec![],
            specialization_constants: BTreeMap::new(),

            vertex_binding_desc: vec![],
            vertex_attribute_desc: vec![],

            primitive_topology: vk::PrimitiveTopology::TRIANGLE_LIST,

            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            // 按照 OpenGL 的传统，将 CCW 视为 front face
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,

            msaa_sample: vk::SampleCountFlags::TYPE_1,

            // format = undefined 表示不使用这个 attachment
            color_attach_formats: vec![],
            depth_attach_format: vk::Format::UNDEFINED,
            stencil_attach_format: vk::Format::UNDEFINED,

            depth_test_enable: true,
            depth_write_enable: true,
            depth_compare_op: vk::CompareOp::LESS,

            color_attach_blend_states: vec![],
            blend_constants: [0.0; 4],

            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],

            push_constant_ranges: vec![],
            pipeline_layout: vk::PipelineLayout::null(),
        }
    }
}
// builder
impl FlatCreateInfo {
    /// 同一个 stage 再次添加时替换之前的
    pub fn shader_stage(&mut self, stage: ShaderStage) -> &mut Self {
        match self.shader_stages.iter_mut().find(|s| s.stage == stage.stage) {
            Some(existing) => *existing = stage,
            None => self.shader_stages.push(stage),
        }
        self
    }

    #[inline]
    pub fn specialization_constant(&mut self, stage: vk::ShaderStageFlags, constant_id: u32, value: u32) -> &mut Self {
        self.specialization_constants.insert((stage.as_raw(), constant_id), value);
        self
    }

    #[inline]
    pub fn vertex_binding(&mut self, bindings: Vec<vk::VertexInputBindingDescription>) -> &mut Self {
        self.vertex_binding_desc = bindings;
        self
    }

    #[inline]
    pub fn vertex_attribute(&mut self, attributes: Vec<vk::VertexInputAttributeDescription>) -> &mut Self {
        self.vertex_attribute_desc = attributes;
        self
    }

    #[inline]
    pub fn primitive_topology(&mut self, topology: vk::PrimitiveTopology) -> &mut Self {
        self.primitive_topology = topology;
        self
    }

    #[inline]
    pub fn polygon_mode(&mut self, mode: vk::PolygonMode) -> &mut Self {
        self.polygon_mode = mode;
        self
    }

    #[inline]
    pub fn cull_mode(&mut self, mode: vk::CullModeFlags, front_face: vk::FrontFace) -> &mut Self {
        self.cull_mode = mode;
        self.front_face = front_face;
        self
    }

    #[inline]
    pub fn set_line_width(&mut self, line_width: f32) -> &mut Self {
        self.line_width = line_width;
        self
    }

    #[inline]
    pub fn msaa_sample(&mut self, sample: vk::SampleCountFlags) -> &mut Self {
        self.msaa_sample = sample;
        self
    }

    #[inline]
    pub fn attach_info(
        &mut self,
        color_attach_formats: Vec<vk::Format>,
        depth_format: Option<vk::Format>,
        stencil_format: Option<vk::Format>,
    ) -> &mut Self {
        self.color_attach_formats = color_attach_formats;
        self.depth_attach_format = depth_format.unwrap_or(vk::Format::UNDEFINED);
        self.stencil_attach_format = stencil_format.unwrap_or(vk::Format::UNDEFINED);
        self
    }

    /// `None` 表示关闭深度测试
    #[inline]
    pub fn depth_test(&mut self, depth_test_op: Option<vk::CompareOp>, depth_write: bool) -> &mut Self {
        self.depth_test_enable = depth_test_op.is_some();
        self.depth_compare_op = depth_test_op.unwrap_or(vk::CompareOp::NEVER);
        self.depth_write_enable = depth_write;
        self
    }

    /// 为每个 color attachment 指定 blend 操作
    #[inline]
    pub fn color_blend(
        &mut self,
        states: Vec<vk::PipelineColorBlendAttachmentState>,
        blend_constants: [f32; 4],
    ) -> &mut Self {
        self.color_attach_blend_states = states;
        self.blend_constants = blend_constants;
        self
    }

    /// 替换某一个 color attachment 的 blend 状态，不足的部分用默认值补齐
    pub fn attachment_blend(&mut self, attachment: usize, state: vk::PipelineColorBlendAttachmentState) -> &mut Self {
        if self.color_attach_blend_states.len() <= attachment {
            self.color_attach_blend_states
                .resize(attachment + 1, vk::PipelineColorBlendAttachmentState::default());
        }
        self.color_attach_blend_states[attachment] = state;
        self
    }

    #[inline]
    pub fn dynamic_states(&mut self, states: Vec<vk::DynamicState>) -> &mut Self {
        self.dynamic_states = states;
        self
    }

    #[inline]
    pub fn pipeline_layout(&mut self, layout: vk::PipelineLayout) -> &mut Self {
        self.pipeline_layout = layout;
        self
    }

    /// 添加 push constant range
    ///
    /// - 与已有的 range 没有共同的 stage：直接加入
    /// - 有共同的 stage：必须和已有的 range 共享起点或终点，新的 range 替换旧的
    /// - 有共同的 stage 但起点终点都不同：`PushConstantRangeConflict`
    pub fn insert_push_constant_range(&mut self, range: vk::PushConstantRange) -> PipelineResult<&mut Self> {
        let end = range.offset + range.size;
        if let Some(existing) = self.push_constant_ranges.iter().find(|existing| {
            existing.stage_flags.intersects(range.stage_flags)
                && existing.offset != range.offset
                && existing.offset + existing.size != end
        }) {
            return Err(PipelineFactoryError::PushConstantRangeConflict {
                existing: *existing,
                new: range,
            });
        }

        self.push_constant_ranges
            .retain(|existing| !existing.stage_flags.intersects(range.stage_flags));
        let position = self
            .push_constant_ranges
            .partition_point(|existing| existing.stage_flags.as_raw() < range.stage_flags.as_raw());
        self.push_constant_ranges.insert(position, range);
        Ok(self)
    }
}
// getters
impl FlatCreateInfo {
    #[inline]
    pub fn shader_stages(&self) -> &[ShaderStage] {
        &self.shader_stages
    }

    /// 某个 stage 的特化常量，按 constant id 排序
    pub fn specialization_constants(&self, stage: vk::ShaderStageFlags) -> Vec<(u32, u32)> {
        let stage = stage.as_raw();
        self.specialization_constants
            .range((stage, 0)..=(stage, u32::MAX))
            .map(|(&(_, constant_id), &value)| (constant_id, value))
            .collect()
    }

    #[inline]
    pub fn vertex_binding_desc(&self) -> &[vk::VertexInputBindingDescription] {
        &self.vertex_binding_desc
    }

    #[inline]
    pub fn vertex_attribute_desc(&self) -> &[vk::VertexInputAttributeDescription] {
        &self.vertex_attribute_desc
    }

    #[inline]
    pub fn topology(&self) -> vk::PrimitiveTopology {
        self.primitive_topology
    }

    #[inline]
    pub fn polygon(&self) -> vk::PolygonMode {
        self.polygon_mode
    }

    #[inline]
    pub fn cull(&self) -> (vk::CullModeFlags, vk::FrontFace) {
        (self.cull_mode, self.front_face)
    }

    #[inline]
    pub fn line_width(&self) -> f32 {
        self.line_width
    }

    #[inline]
    pub fn samples(&self) -> vk::SampleCountFlags {
        self.msaa_sample
    }

    #[inline]
    pub fn color_attach_formats(&self) -> &[vk::Format] {
        &self.color_attach_formats
    }

    #[inline]
    pub fn depth_attach_format(&self) -> vk::Format {
        self.depth_attach_format
    }

    #[inline]
    pub fn stencil_attach_format(&self) -> vk::Format {
        self.stencil_attach_format
    }

    /// (test enable, write enable, compare op)
    #[inline]
    pub fn depth_state(&self) -> (bool, bool, vk::CompareOp) {
        (self.depth_test_enable, self.depth_write_enable, self.depth_compare_op)
    }

    #[inline]
    pub fn color_attach_blend_states(&self) -> &[vk::PipelineColorBlendAttachmentState] {
        &self.color_attach_blend_states
    }

    #[inline]
    pub fn blend_constants(&self) -> [f32; 4] {
        self.blend_constants
    }

    #[inline]
    pub fn dynamic_state_list(&self) -> &[vk::DynamicState] {
        &self.dynamic_states
    }

    #[inline]
    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_constant_ranges
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }
}
// tools
impl FlatCreateInfo {
    /// 所有字段的 hash，和组合索引一起作为 pipeline cache 的 key
    pub fn content_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();

        self.shader_stages.hash(&mut hasher);
        self.specialization_constants.hash(&mut hasher);

        for binding in &self.vertex_binding_desc {
            (binding.binding, binding.stride, binding.input_rate.as_raw()).hash(&mut hasher);
        }
        for attribute in &self.vertex_attribute_desc {
            (attribute.location, attribute.binding, attribute.format.as_raw(), attribute.offset).hash(&mut hasher);
        }

        self.primitive_topology.as_raw().hash(&mut hasher);
        (
            self.polygon_mode.as_raw(),
            self.cull_mode.as_raw(),
            self.front_face.as_raw(),
            self.line_width.to_bits(),
        )
            .hash(&mut hasher);
        self.msaa_sample.as_raw().hash(&mut hasher);

        for format in &self.color_attach_formats {
            format.as_raw().hash(&mut hasher);
        }
        (self.depth_attach_format.as_raw(), self.stencil_attach_format.as_raw()).hash(&mut hasher);
        (self.depth_test_enable, self.depth_write_enable, self.depth_compare_op.as_raw()).hash(&mut hasher);

        for state in &self.color_attach_blend_states {
            (
                state.blend_enable,
                state.src_color_blend_factor.as_raw(),
                state.dst_color_blend_factor.as_raw(),
                state.color_blend_op.as_raw(),
                state.src_alpha_blend_factor.as_raw(),
                state.dst_alpha_blend_factor.as_raw(),
                state.alpha_blend_op.as_raw(),
                state.color_write_mask.as_raw(),
            )
                .hash(&mut hasher);
        }
        self.blend_constants.map(f32::to_bits).hash(&mut hasher);

        for state in &self.dynamic_states {
            state.as_raw().hash(&mut hasher);
        }
        for range in &self.push_constant_ranges {
            (range.stage_flags.as_raw(), range.offset, range.size).hash(&mut hasher);
        }
        self.pipeline_layout.hash(&mut hasher);

        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_range(stage_flags: vk::ShaderStageFlags, offset: u32, size: u32) -> vk::PushConstantRange {
        vk::PushConstantRange {
            stage_flags,
            offset,
            size,
        }
    }

    #[test]
    fn test_disjoint_push_constant_ranges_coexist() {
        let mut info = FlatCreateInfo::default();
        info.insert_push_constant_range(push_range(vk::ShaderStageFlags::FRAGMENT, 64, 16))
            .unwrap();
        info.insert_push_constant_range(push_range(vk::ShaderStageFlags::VERTEX, 0, 64))
            .unwrap();

        let ranges = info.push_constant_ranges();
        assert_eq!(ranges.len(), 2);
        // 按 stage flags 排序：VERTEX(1) 在 FRAGMENT(16) 之前
        assert_eq!(ranges[0].stage_flags, vk::ShaderStageFlags::VERTEX);
        assert_eq!(ranges[1].stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn test_overlapping_push_constant_range_replaces_when_sharing_an_end() {
        let mut info = FlatCreateInfo::default();
        info.insert_push_constant_range(push_range(vk::ShaderStageFlags::VERTEX, 0, 16))
            .unwrap();

        // 起点相同，范围变大
        info.insert_push_constant_range(push_range(vk::ShaderStageFlags::VERTEX, 0, 32))
            .unwrap();
        assert_eq!(info.push_constant_ranges().len(), 1);
        assert_eq!(info.push_constant_ranges()[0].size, 32);

        // 终点相同
        info.insert_push_constant_range(push_range(vk::ShaderStageFlags::ALL_GRAPHICS, 16, 16))
            .unwrap();
        assert_eq!(info.push_constant_ranges().len(), 1);
        assert_eq!(info.push_constant_ranges()[0].stage_flags, vk::ShaderStageFlags::ALL_GRAPHICS);
        assert_eq!(info.push_constant_ranges()[0].offset, 16);
    }

    #[test]
    fn test_overlapping_push_constant_range_conflict() {
        let mut info = FlatCreateInfo::default();
        info.insert_push_constant_range(push_range(vk::ShaderStageFlags::VERTEX, 0, 16))
            .unwrap();

        let err = info
            .insert_push_constant_range(push_range(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT, 4, 8))
            .unwrap_err();
        match err {
            PipelineFactoryError::PushConstantRangeConflict { existing, new } => {
                assert_eq!((existing.offset, existing.size), (0, 16));
                assert_eq!((new.offset, new.size), (4, 8));
            }
            other => panic!("unexpected error: {other}"),
        }
        // 失败时保持原状
        assert_eq!(info.push_constant_ranges().len(), 1);
        assert_eq!(info.push_constant_ranges()[0].size, 16);
    }

    #[test]
    fn test_clone_is_independent_of_base() {
        let mut base = FlatCreateInfo::default();
        base.attach_info(vec![vk::Format::R8G8B8A8_SRGB], Some(vk::Format::D32_SFLOAT), None);
        let base_hash = base.content_hash();

        let mut variant = base.clone();
        variant.primitive_topology(vk::PrimitiveTopology::LINE_LIST);
        assert_ne!(variant.content_hash(), base_hash);
        assert_eq!(base.topology(), vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(base.content_hash(), base_hash);

        // 相同的内容产生相同的 hash
        let mut again = base.clone();
        again.primitive_topology(vk::PrimitiveTopology::LINE_LIST);
        assert_eq!(again.content_hash(), variant.content_hash());
    }

    #[test]
    fn test_specialization_constants_are_per_stage() {
        let mut info = FlatCreateInfo::default();
        info.specialization_constant(vk::ShaderStageFlags::FRAGMENT, 3, 30)
            .specialization_constant(vk::ShaderStageFlags::FRAGMENT, 1, 10)
            .specialization_constant(vk::ShaderStageFlags::VERTEX, 1, 99);

        assert_eq!(info.specialization_constants(vk::ShaderStageFlags::FRAGMENT), vec![(1, 10), (3, 30)]);
        assert_eq!(info.specialization_constants(vk::ShaderStageFlags::VERTEX), vec![(1, 99)]);
        assert!(info.specialization_constants(vk::ShaderStageFlags::COMPUTE).is_empty());
    }

    #[test]
    fn test_shader_stage_replaces_same_stage() {
        use ash::vk::Handle;

        let mut info = FlatCreateInfo::default();
        info.shader_stage(ShaderStage::new(vk::ShaderStageFlags::VERTEX, vk::ShaderModule::from_raw(1), c"main"))
            .shader_stage(ShaderStage::new(vk::ShaderStageFlags::FRAGMENT, vk::ShaderModule::from_raw(2), c"main"))
            .shader_stage(ShaderStage::new(vk::ShaderStageFlags::VERTEX, vk::ShaderModule::from_raw(3), c"vs_main"));

        assert_eq!(info.shader_stages().len(), 2);
        assert_eq!(info.shader_stages()[0].module, vk::ShaderModule::from_raw(3));
        assert_eq!(info.shader_stages()[0].entry_point.as_c_str(), c"vs_main");
    }
}
