//! Truvis 异步管线工厂
//!
//! 给定一组互相独立的 characteristic（混合模式、拓扑、特化常量……），
//! 在 worker 线程上枚举它们的所有组合，为每个组合创建 graphics pipeline，
//! 然后在渲染线程上交给调用者。渲染循环只需要每帧调用一次 [`PipelineHub::update`]。
//!
//! ```ignore
//! let slot = hub.create_pipeline_slot();
//! let factory = hub.create_pipeline_factory(PipelineFactoryDesc { name, cache_name, slot })?;
//! hub.add_singleton(factory, shader_program)?;
//! hub.add_characteristic(factory, Arc::new(BlendModeRange::new(0, modes)))?;
//! hub.start(factory)?;
//! hub.generate(factory)?;
//!
//! // 每帧
//! hub.update();
//! if let Some(pipeline) = hub.pipeline(slot, index) { /* draw */ }
//! ```

pub mod characteristic;
pub mod common_characteristics;
pub mod compiler;
pub mod error;
pub mod flat_create_info;
pub mod handles;
pub mod multi_loop;
pub mod pipeline;
pub mod pipeline_cache;
pub mod pipeline_factory;
pub mod pipeline_hub;
pub mod pipeline_index;
pub mod pipeline_settings;

pub use pipeline_hub::{FactoryStatus, PipelineFactoryDesc, PipelineHub};
