use crate::characteristic::IndexRange;

/// 多维计数器，按里程表的方式枚举所有组合
///
/// 最后注册的维度变化最快，向前进位；最外层溢出后 `finished` 置位，不能重新开始。
/// 没有任何维度时只有一个组合（空元组）。
#[derive(Debug, Clone)]
pub struct MultiLoop {
    ranges: Vec<IndexRange>,
    counters: Vec<i32>,
    finished: bool,
}
impl MultiLoop {
    pub fn new(ranges: &[IndexRange]) -> Self {
        Self {
            ranges: ranges.to_vec(),
            counters: ranges.iter().map(IndexRange::ibegin).collect(),
            finished: false,
        }
    }

    /// 当前组合，每个维度一个取值
    #[inline]
    pub fn current(&self) -> &[i32] {
        &self.counters
    }

    #[inline]
    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn combination_count(&self) -> u64 {
        self.ranges.iter().map(IndexRange::len).product()
    }

    pub fn advance(&mut self) {
        if self.finished {
            return;
        }

        for (counter, range) in self.counters.iter_mut().zip(&self.ranges).rev() {
            *counter += 1;
            if *counter < range.iend() {
                return;
            }
            *counter = range.ibegin();
        }
        self.finished = true;
    }
}
impl Iterator for MultiLoop {
    type Item = Vec<i32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let combination = self.counters.clone();
        self.advance();
        Some(combination)
    }
}
