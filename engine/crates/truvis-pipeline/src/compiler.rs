use crate::flat_create_info::FlatCreateInfo;
use crate::pipeline::Pipeline;
use crate::pipeline_index::PipelineIndex;
use anyhow::Context;
use ash::vk;
use itertools::Itertools;

/// 把 `FlatCreateInfo` 变成真正的图形 API 对象
///
/// 在 worker 线程上调用，实现必须是线程安全的。
pub trait PipelineCompiler: Send + Sync {
    fn compile(&self, flat_create_info: &FlatCreateInfo, index: PipelineIndex) -> anyhow::Result<Pipeline>;

    fn destroy(&self, pipeline: Pipeline);
}

/// 基于 `ash::Device` 的 compiler，使用 dynamic rendering
pub struct VkPipelineCompiler {
    device: ash::Device,
    /// 驱动层面的 pipeline cache，可以为 null
    driver_cache: vk::PipelineCache,
}
// new & init
impl VkPipelineCompiler {
    pub fn new(device: ash::Device, driver_cache: vk::PipelineCache) -> Self {
        Self { device, driver_cache }
    }
}
impl PipelineCompiler for VkPipelineCompiler {
    fn compile(&self, flat_create_info: &FlatCreateInfo, index: PipelineIndex) -> anyhow::Result<Pipeline> {
        let layout = flat_create_info.layout();
        anyhow::ensure!(layout != vk::PipelineLayout::null(), "pipeline layout is not set");

        // dynamic rendering 需要的 framebuffer 信息
        let mut attach_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(flat_create_info.color_attach_formats())
            .depth_attachment_format(flat_create_info.depth_attach_format())
            .stencil_attachment_format(flat_create_info.stencil_attach_format());

        // 特化常量：每个 stage 一份连续的 u32 数据
        let specialization_data = flat_create_info
            .shader_stages()
            .iter()
            .map(|stage| {
                let constants = flat_create_info.specialization_constants(stage.stage);
                let entries = constants
                    .iter()
                    .enumerate()
                    .map(|(i, &(constant_id, _))| vk::SpecializationMapEntry {
                        constant_id,
                        offset: (i * size_of::<u32>()) as u32,
                        size: size_of::<u32>(),
                    })
                    .collect_vec();
                let data = constants.iter().flat_map(|&(_, value)| value.to_ne_bytes()).collect_vec();
                (entries, data)
            })
            .collect_vec();
        let specialization_infos = specialization_data
            .iter()
            .map(|(entries, data)| vk::SpecializationInfo::default().map_entries(entries).data(data))
            .collect_vec();

        let shader_stages_info = flat_create_info
            .shader_stages()
            .iter()
            .zip(&specialization_infos)
            .map(|(stage, specialization_info)| {
                let stage_info = vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(&stage.entry_point);
                if specialization_info.map_entry_count == 0 {
                    stage_info
                } else {
                    stage_info.specialization_info(specialization_info)
                }
            })
            .collect_vec();

        // 顶点和 index
        let vertex_input_state_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(flat_create_info.vertex_binding_desc())
            .vertex_attribute_descriptions(flat_create_info.vertex_attribute_desc());

        let input_assembly_info = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(flat_create_info.topology())
            .primitive_restart_enable(false);

        // viewport 和 scissor 具体值由 dynamic 决定，但是数量由该 create info 决定
        let viewport_info = vk::PipelineViewportStateCreateInfo {
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };

        let (cull_mode, front_face) = flat_create_info.cull();
        let rasterize_state_info = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(flat_create_info.polygon())
            .line_width(flat_create_info.line_width())
            .cull_mode(cull_mode)
            .front_face(front_face)
            .depth_bias_enable(false);

        let msaa_info =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(flat_create_info.samples());

        // 混合设置：需要为每个 color attachment 分别指定
        let color_blend_info = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(flat_create_info.color_attach_blend_states())
            .blend_constants(flat_create_info.blend_constants());

        let (depth_test, depth_write, depth_compare_op) = flat_create_info.depth_state();
        let depth_stencil_info = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_test)
            .depth_write_enable(depth_write)
            .depth_compare_op(depth_compare_op)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let dynamic_state_info =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(flat_create_info.dynamic_state_list());

        // =======================================
        // === 创建 pipeline

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages_info)
            .vertex_input_state(&vertex_input_state_info)
            .input_assembly_state(&input_assembly_info)
            .viewport_state(&viewport_info)
            .rasterization_state(&rasterize_state_info)
            .multisample_state(&msaa_info)
            .color_blend_state(&color_blend_info)
            .depth_stencil_state(&depth_stencil_info)
            .layout(layout)
            .dynamic_state(&dynamic_state_info)
            .push_next(&mut attach_info);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(self.driver_cache, std::slice::from_ref(&pipeline_info), None)
                .map_err(|(_, result)| result)
                .with_context(|| format!("vkCreateGraphicsPipelines failed for pipeline {index}"))?
        };
        let handle = pipelines
            .into_iter()
            .next()
            .with_context(|| format!("no pipeline returned for pipeline {index}"))?;

        log::debug!("created vk pipeline {:?} for {}", handle, index);
        Ok(Pipeline::new(handle, layout, index))
    }

    fn destroy(&self, pipeline: Pipeline) {
        unsafe {
            self.device.destroy_pipeline(pipeline.handle(), None);
        }
    }
}
