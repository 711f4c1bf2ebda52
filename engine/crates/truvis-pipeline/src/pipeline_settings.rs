use ash::vk;
use std::time::Duration;
use truvis_task::task_engine::TaskEngineSettings;

/// 管线工厂默认配置
pub struct DefaultPipelineSettings;
impl DefaultPipelineSettings {
    // shader 输出会被自动改变： liner -> sRGB
    pub const COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;
    pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
    pub const WORKER_THREAD_PREFIX: &'static str = "Pipeline-Factory";
}

/// 帧级渲染配置，characteristic 在 initialize 时通过 `CharacteristicContext` 读取
#[derive(Copy, Clone, Debug)]
pub struct FrameSettings {
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    /// `UNDEFINED` 表示不使用 stencil
    pub stencil_format: vk::Format,
    pub sample_count: vk::SampleCountFlags,
}
impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            color_format: DefaultPipelineSettings::COLOR_FORMAT,
            depth_format: DefaultPipelineSettings::DEPTH_FORMAT,
            stencil_format: vk::Format::UNDEFINED,
            sample_count: vk::SampleCountFlags::TYPE_1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineHubSettings {
    pub engine: TaskEngineSettings,
    pub frame: FrameSettings,
    /// shutdown 时等待工厂结束的最长时间
    pub shutdown_timeout: Duration,
}
impl Default for PipelineHubSettings {
    fn default() -> Self {
        Self {
            engine: TaskEngineSettings {
                worker_threads: 0,
                thread_name_prefix: DefaultPipelineSettings::WORKER_THREAD_PREFIX.to_string(),
            },
            frame: FrameSettings::default(),
            shutdown_timeout: DefaultPipelineSettings::SHUTDOWN_TIMEOUT,
        }
    }
}
