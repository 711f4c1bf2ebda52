use crate::error::{PipelineResult, RangeViolation};
use crate::flat_create_info::FlatCreateInfo;
use crate::pipeline_index::PipelineIndex;
use crate::pipeline_settings::FrameSettings;

/// 一个 characteristic 的取值范围 `[begin, end)`
///
/// `range_width` 是编码 `end - begin` 个取值所需的位数，只有一个取值时为 0。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexRange {
    begin: i32,
    end: i32,
    range_width: u32,
}
// new & init
impl IndexRange {
    /// 只有一个取值 `[0, 1)` 的范围
    pub const SINGLE: Self = Self::new(0, 1);

    /// # Panics
    /// `end <= begin`
    pub const fn new(begin: i32, end: i32) -> Self {
        assert!(end > begin, "IndexRange requires end > begin");

        let max_offset = (end as i64 - begin as i64 - 1) as u64;
        let range_width = u64::BITS - max_offset.leading_zeros();
        Self {
            begin,
            end,
            range_width,
        }
    }
}
// getters
impl IndexRange {
    #[inline]
    pub const fn ibegin(&self) -> i32 {
        self.begin
    }

    #[inline]
    pub const fn iend(&self) -> i32 {
        self.end
    }

    #[inline]
    pub const fn range_width(&self) -> u32 {
        self.range_width
    }

    /// 取值的数量
    #[inline]
    pub const fn len(&self) -> u64 {
        (self.end as i64 - self.begin as i64) as u64
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    pub const fn contains(&self, index: i32) -> bool {
        self.begin <= index && index < self.end
    }
}
// tools
impl IndexRange {
    /// 把 `index` 追加到组合索引的低位
    pub fn update(&self, pipeline_index: &mut PipelineIndex, index: i32) -> Result<(), RangeViolation> {
        if !self.contains(index) {
            return Err(RangeViolation {
                index,
                begin: self.begin,
                end: self.end,
            });
        }

        pipeline_index.push(self.range_width, (index as i64 - self.begin as i64) as u64);
        Ok(())
    }
}

/// characteristic 在 `initialize` 时可以读取的工厂信息
pub struct CharacteristicContext<'a> {
    pub factory_name: &'a str,
    pub frame_settings: &'a FrameSettings,
}

/// 管线的一个变化维度，例如混合模式、拓扑、特化常量
///
/// - `initialize` 在每个工厂中只调用一次，按注册顺序，早于任何 `fill`
/// - `fill` 对每个组合调用一次，只能依赖 `index` 和 `initialize` 写入的基础状态；
///   每个组合拿到的都是基础状态的新拷贝，看不到其他组合的写入
///
/// 实现者之间通过 `FlatCreateInfo` 交换数据，不应该持有可变的共享状态。
pub trait CharacteristicRange: Send + Sync {
    /// 在同一个工厂中唯一
    fn name(&self) -> &str;

    fn range(&self) -> IndexRange;

    fn initialize(&self, flat_create_info: &mut FlatCreateInfo, context: &CharacteristicContext) -> PipelineResult<()>;

    fn fill(&self, flat_create_info: &mut FlatCreateInfo, index: i32);

    /// 为 true 时工厂会跳过 `fill`
    fn is_singleton(&self) -> bool {
        false
    }

    #[inline]
    fn ibegin(&self) -> i32 {
        self.range().ibegin()
    }

    #[inline]
    fn iend(&self) -> i32 {
        self.range().iend()
    }
}

/// 只有一个取值的 characteristic，所有工作都在 `initialize` 中完成
///
/// 通过 [`Singleton`] 注册到工厂。
pub trait Characteristic: Send + Sync {
    fn name(&self) -> &str;

    fn initialize(&self, flat_create_info: &mut FlatCreateInfo, context: &CharacteristicContext) -> PipelineResult<()>;
}

/// 把 [`Characteristic`] 包装成范围为 `[0, 1)` 的 [`CharacteristicRange`]
pub struct Singleton<C>(pub C);
impl<C: Characteristic> CharacteristicRange for Singleton<C> {
    #[inline]
    fn name(&self) -> &str {
        self.0.name()
    }

    #[inline]
    fn range(&self) -> IndexRange {
        IndexRange::SINGLE
    }

    fn initialize(&self, flat_create_info: &mut FlatCreateInfo, context: &CharacteristicContext) -> PipelineResult<()> {
        self.0.initialize(flat_create_info, context)
    }

    #[inline]
    fn fill(&self, _flat_create_info: &mut FlatCreateInfo, _index: i32) {}

    #[inline]
    fn is_singleton(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_width() {
        assert_eq!(IndexRange::new(0, 1).range_width(), 0);
        assert_eq!(IndexRange::new(0, 2).range_width(), 1);
        assert_eq!(IndexRange::new(0, 3).range_width(), 2);
        assert_eq!(IndexRange::new(0, 4).range_width(), 2);
        assert_eq!(IndexRange::new(0, 5).range_width(), 3);
        assert_eq!(IndexRange::new(3, 11).range_width(), 3);
        assert_eq!(IndexRange::new(-4, 4).range_width(), 3);
        assert_eq!(IndexRange::new(i32::MIN, i32::MAX).range_width(), 32);
    }

    #[test]
    fn test_update_rejects_values_outside_range() {
        let range = IndexRange::new(3, 11);
        let mut index = PipelineIndex::ZERO;

        assert_eq!(
            range.update(&mut index, 11),
            Err(RangeViolation {
                index: 11,
                begin: 3,
                end: 11
            })
        );
        assert_eq!(
            range.update(&mut index, 2),
            Err(RangeViolation {
                index: 2,
                begin: 3,
                end: 11
            })
        );
        // 失败的 update 不修改索引
        assert_eq!(index, PipelineIndex::ZERO);

        range.update(&mut index, 10).unwrap();
        assert_eq!(index.raw(), 7);
    }

    #[test]
    fn test_update_shifts_previous_bits() {
        let mut index = PipelineIndex::ZERO;
        IndexRange::new(0, 2).update(&mut index, 1).unwrap();
        IndexRange::new(0, 1).update(&mut index, 0).unwrap();
        IndexRange::new(10, 14).update(&mut index, 12).unwrap();
        assert_eq!(index.raw(), 0b1_10);
    }

    #[test]
    #[should_panic]
    fn test_empty_range_panics() {
        let _ = IndexRange::new(4, 4);
    }

    struct NamedOnly;
    impl Characteristic for NamedOnly {
        fn name(&self) -> &str {
            "named-only"
        }

        fn initialize(&self, flat_create_info: &mut FlatCreateInfo, _: &CharacteristicContext) -> PipelineResult<()> {
            flat_create_info.set_line_width(2.0);
            Ok(())
        }
    }

    #[test]
    fn test_singleton_wrapper() {
        let singleton = Singleton(NamedOnly);
        assert_eq!(singleton.name(), "named-only");
        assert_eq!(singleton.range(), IndexRange::SINGLE);
        assert_eq!((singleton.ibegin(), singleton.iend()), (0, 1));
        assert!(singleton.is_singleton());

        let frame_settings = FrameSettings::default();
        let context = CharacteristicContext {
            factory_name: "test",
            frame_settings: &frame_settings,
        };
        let mut flat_create_info = FlatCreateInfo::default();
        singleton.initialize(&mut flat_create_info, &context).unwrap();

        let before = flat_create_info.content_hash();
        singleton.fill(&mut flat_create_info, 0);
        assert_eq!(flat_create_info.content_hash(), before);
        assert_eq!(flat_create_info.line_width(), 2.0);
    }
}
