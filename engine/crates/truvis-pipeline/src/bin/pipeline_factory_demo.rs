//! 在没有 GPU 的情况下演示管线工厂
//!
//! 用一个只分配假句柄的 compiler 代替 `VkPipelineCompiler`，模拟渲染循环每帧调用
//! `PipelineHub::update`，直到所有工厂结束。

use ash::vk;
use ash::vk::Handle;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use truvis_crate_tools::init_log::init_log;
use truvis_pipeline::characteristic::IndexRange;
use truvis_pipeline::common_characteristics::{
    BlendMode, BlendModeRange, FrameAttachments, ShaderProgram, SpecializationConstantRange, TopologyRange,
};
use truvis_pipeline::compiler::PipelineCompiler;
use truvis_pipeline::flat_create_info::{FlatCreateInfo, ShaderStage};
use truvis_pipeline::pipeline::Pipeline;
use truvis_pipeline::pipeline_cache::{PipelineCacheProvider, PipelineCacheRegistry};
use truvis_pipeline::pipeline_index::PipelineIndex;
use truvis_pipeline::pipeline_settings::PipelineHubSettings;
use truvis_pipeline::{FactoryStatus, PipelineFactoryDesc, PipelineHub};

/// 模拟一次耗时的 pipeline 编译
struct HeadlessCompiler {
    next_handle: AtomicU64,
    compile_time: Duration,
}
impl PipelineCompiler for HeadlessCompiler {
    fn compile(&self, flat_create_info: &FlatCreateInfo, index: PipelineIndex) -> anyhow::Result<Pipeline> {
        std::thread::sleep(self.compile_time);
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Pipeline::new(vk::Pipeline::from_raw(raw), flat_create_info.layout(), index))
    }

    fn destroy(&self, pipeline: Pipeline) {
        log::debug!("destroy pipeline {:?}", pipeline.handle());
    }
}

fn forward_program() -> ShaderProgram {
    ShaderProgram {
        name: "forward-program".to_string(),
        stages: vec![
            ShaderStage::new(vk::ShaderStageFlags::VERTEX, vk::ShaderModule::from_raw(1), c"main"),
            ShaderStage::new(vk::ShaderStageFlags::FRAGMENT, vk::ShaderModule::from_raw(2), c"main"),
        ],
        layout: vk::PipelineLayout::from_raw(1),
        push_constant_ranges: vec![vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: 128,
        }],
    }
}

fn main() -> anyhow::Result<()> {
    init_log();

    let compiler = Arc::new(HeadlessCompiler {
        next_handle: AtomicU64::new(0),
        compile_time: Duration::from_millis(2),
    });
    let cache_registry = Arc::new(PipelineCacheRegistry::new(Some(4)));
    let mut hub = PipelineHub::new(
        PipelineHubSettings::default(),
        compiler.clone(),
        cache_registry.clone() as Arc<dyn PipelineCacheProvider>,
    )?;

    // 两个工厂使用相同的 characteristic 和 cache，第二个工厂全部命中 cache
    let mut factories = vec![];
    for name in ["forward-main-view", "forward-reflection"] {
        let slot = hub.create_pipeline_slot();
        let factory = hub.create_pipeline_factory(PipelineFactoryDesc {
            name: name.to_string(),
            cache_name: "forward".to_string(),
            slot,
        })?;

        hub.add_singleton(factory, forward_program())?;
        hub.add_singleton(
            factory,
            FrameAttachments {
                color_attachment_count: 1,
                depth: true,
            },
        )?;
        hub.add_characteristic(
            factory,
            Arc::new(BlendModeRange::new(
                0,
                vec![BlendMode::Opaque, BlendMode::AlphaBlend, BlendMode::Additive],
            )),
        )?;
        hub.add_characteristic(
            factory,
            Arc::new(TopologyRange::new(vec![
                vk::PrimitiveTopology::TRIANGLE_LIST,
                vk::PrimitiveTopology::LINE_LIST,
            ])),
        )?;
        hub.add_characteristic(
            factory,
            Arc::new(SpecializationConstantRange::new(
                "light-count",
                vk::ShaderStageFlags::FRAGMENT,
                0,
                IndexRange::new(1, 5),
            )),
        )?;

        hub.start(factory)?;
        hub.generate(factory)?;
        factories.push((factory, slot));

        // 渲染循环：工厂在后台生成时帧照常推进
        let start = Instant::now();
        let mut frame = 0_u64;
        loop {
            let update = hub.update();
            if update.new_pipelines > 0 {
                log::info!("frame {}: {} new pipelines", frame, update.new_pipelines);
            }
            if update.finished.contains(&factory) {
                break;
            }
            anyhow::ensure!(start.elapsed() < Duration::from_secs(10), "factory `{}` timed out", name);

            std::thread::sleep(Duration::from_millis(1));
            frame += 1;
        }
    }

    for (factory, slot) in &factories {
        match hub.factory_status(*factory) {
            Some(FactoryStatus::Finished(report)) => log::info!(
                "{} pipelines in slot, states {:?}, cache hits {}, misses {}",
                hub.pipeline_slot(*slot).map_or(0, |slot| slot.len()),
                report.states,
                report.cache_hits,
                report.cache_misses
            ),
            other => anyhow::bail!("unexpected factory status: {:?}", other),
        }
        let _ = hub.detach_pipeline_cache(*factory);
    }

    let opaque_triangle = hub.pipeline(factories[0].1, PipelineIndex::ZERO);
    log::info!("opaque triangle pipeline with one light: {:?}", opaque_triangle);

    anyhow::ensure!(hub.shutdown(), "pipeline factories did not stop in time");
    cache_registry.destroy(compiler.as_ref());
    Ok(())
}
