use crate::characteristic::IndexRange;
use crate::error::{PipelineFactoryError, PipelineResult, RangeViolation};
use std::fmt;

/// 管线的组合索引
///
/// 由每个 characteristic 选中的索引按注册顺序拼接而成，先注册的位于高位：
///
/// ```text
/// index = Σ (selected_i - begin_i) << (Σ_{j>i} range_width_j)
/// ```
///
/// 构造方式：从 `PipelineIndex::ZERO` 开始，按注册顺序对每个 characteristic 调用
/// [`IndexRange::update`]。顺序错了不会报错，只会产生冲突的索引。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipelineIndex(u64);
impl PipelineIndex {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// 左移 `range_width` 位并放入 `offset`
    #[inline]
    pub(crate) fn push(&mut self, range_width: u32, offset: u64) {
        self.0 = (self.0 << range_width) | offset;
    }
}
impl fmt::Display for PipelineIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 一个工厂中所有 characteristic 的范围，按注册顺序排列
///
/// 用于检查索引的总位宽，以及把索引还原成每个 characteristic 的取值。
#[derive(Debug, Clone)]
pub struct PipelineIndexLayout {
    ranges: Vec<IndexRange>,
    total_bits: u32,
}
// new & init
impl PipelineIndexLayout {
    pub fn new(ranges: Vec<IndexRange>) -> PipelineResult<Self> {
        let total_bits = ranges.iter().map(|range| range.range_width()).sum();
        if total_bits > u64::BITS {
            return Err(PipelineFactoryError::IndexOverflow { bits: total_bits });
        }
        Ok(Self { ranges, total_bits })
    }
}
// getters
impl PipelineIndexLayout {
    #[inline]
    pub fn ranges(&self) -> &[IndexRange] {
        &self.ranges
    }

    #[inline]
    pub fn total_bits(&self) -> u32 {
        self.total_bits
    }

    /// 所有组合的数量，即各个范围大小的乘积
    pub fn combination_count(&self) -> u64 {
        self.ranges.iter().map(|range| range.len()).product()
    }
}
// tools
impl PipelineIndexLayout {
    pub fn encode(&self, values: &[i32]) -> Result<PipelineIndex, RangeViolation> {
        assert_eq!(values.len(), self.ranges.len(), "one value per characteristic is required");

        let mut index = PipelineIndex::ZERO;
        for (range, &value) in self.ranges.iter().zip(values) {
            range.update(&mut index, value)?;
        }
        Ok(index)
    }

    /// `encode` 的逆运算
    pub fn decode(&self, index: PipelineIndex) -> Vec<i32> {
        let mut raw = index.raw();
        let mut values = vec![0; self.ranges.len()];
        for (value, range) in values.iter_mut().zip(&self.ranges).rev() {
            let width = range.range_width();
            let mask = if width == 0 { 0 } else { u64::MAX >> (u64::BITS - width) };
            *value = (i64::from(range.ibegin()) + (raw & mask) as i64) as i32;
            raw = raw.checked_shr(width).unwrap_or(0);
        }
        values
    }
}
