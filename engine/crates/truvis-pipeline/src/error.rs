//! 管线工厂的错误类型
//!
//! 除了 API 误用（`UnknownFactory` 等）之外，所有错误对工厂都是致命的：
//! 工厂中止，错误通过 `PipelineHub` 交给创建者。核心内部不做任何重试。

use crate::pipeline_index::PipelineIndex;
use ash::vk;
use thiserror::Error;

/// 某个 characteristic 收到了 `[begin, end)` 之外的索引
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("index {index} is outside of [{begin}, {end})")]
pub struct RangeViolation {
    pub index: i32,
    pub begin: i32,
    pub end: i32,
}

#[derive(Error, Debug, Clone)]
pub enum PipelineFactoryError {
    #[error("characteristic `{characteristic}`: {source}")]
    RangeViolation {
        characteristic: String,
        #[source]
        source: RangeViolation,
    },

    #[error("pipeline cache `{cache}` is unavailable: {reason}")]
    CacheUnavailable { cache: String, reason: String },

    #[error("characteristic `{0}` is registered twice")]
    DuplicateRegistration(String),

    #[error("characteristic `{0}` was added after the factory was fully initialized")]
    LateRegistration(String),

    #[error("characteristic `{characteristic}` failed to initialize: {reason}")]
    CharacteristicInitialization { characteristic: String, reason: String },

    #[error("pipeline index needs {bits} bits, at most 64 are available")]
    IndexOverflow { bits: u32 },

    #[error("push constant range {new:?} overlaps {existing:?} without sharing an end")]
    PushConstantRangeConflict {
        existing: vk::PushConstantRange,
        new: vk::PushConstantRange,
    },

    #[error("failed to create pipeline {index}: {reason}")]
    PipelineCreation { index: PipelineIndex, reason: String },

    #[error("pipeline factory was aborted")]
    Aborted,

    #[error("unknown pipeline factory")]
    UnknownFactory,

    #[error("unknown pipeline slot")]
    UnknownSlot,

    #[error("pipeline factory `{0}` was already started")]
    AlreadyStarted(String),
}

pub type PipelineResult<T> = Result<T, PipelineFactoryError>;
