//! 수신 측 gap block 집합
//!
//! cumulative TSN 위쪽에서 수신한 TSN 구간을 정렬, 비중첩 상태로 유지한다.
//! 변경은 `insert`와 `remove_through` (및 이를 이용한 흡수)로만 이루어진다.

use crate::seq::{tsn_gt, tsn_le, tsn_lt};

/// 정렬된 (begin, end) TSN 구간 목록
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SackGapSet {
    blocks: Vec<(u32, u32)>,
}

impl SackGapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// block 개수
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.blocks.iter().copied()
    }

    pub fn first(&self) -> Option<(u32, u32)> {
        self.blocks.first().copied()
    }

    /// 가장 높은 수신 TSN
    pub fn highest(&self) -> Option<u32> {
        self.blocks.last().map(|&(_, end)| end)
    }

    pub fn contains(&self, tsn: u32) -> bool {
        self.blocks
            .iter()
            .any(|&(begin, end)| tsn_le(begin, tsn) && tsn_le(tsn, end))
    }

    /// TSN 추가, 인접 block과 병합
    ///
    /// 이미 포함되어 있으면 false.
    pub fn insert(&mut self, tsn: u32) -> bool {
        let mut idx = 0;
        while idx < self.blocks.len() {
            let (begin, end) = self.blocks[idx];
            if tsn_le(begin, tsn) && tsn_le(tsn, end) {
                return false;
            }
            if tsn_lt(tsn, begin) {
                break;
            }
            idx += 1;
        }

        let joins_prev = idx > 0 && self.blocks[idx - 1].1.wrapping_add(1) == tsn;
        let joins_next = idx < self.blocks.len() && tsn.wrapping_add(1) == self.blocks[idx].0;

        match (joins_prev, joins_next) {
            (true, true) => {
                self.blocks[idx - 1].1 = self.blocks[idx].1;
                self.blocks.remove(idx);
            }
            (true, false) => self.blocks[idx - 1].1 = tsn,
            (false, true) => self.blocks[idx].0 = tsn,
            (false, false) => self.blocks.insert(idx, (tsn, tsn)),
        }
        true
    }

    /// `tsn` 이하 구간 제거 (걸친 block은 잘라냄)
    pub fn remove_through(&mut self, tsn: u32) {
        self.blocks.retain(|&(_, end)| tsn_gt(end, tsn));
        if let Some(first) = self.blocks.first_mut() {
            if tsn_le(first.0, tsn) {
                first.0 = tsn.wrapping_add(1);
            }
        }
    }

    /// 첫 block이 `cum + 1`에서 시작하면 제거하고 그 끝을 새 cumulative TSN으로 반환
    pub fn absorb(&mut self, cum: u32) -> Option<u32> {
        match self.blocks.first() {
            Some(&(begin, end)) if begin == cum.wrapping_add(1) => {
                self.blocks.remove(0);
                Some(end)
            }
            _ => None,
        }
    }

    /// SACK용 16비트 오프셋 목록
    pub fn to_offsets(&self, cum: u32, max_blocks: usize) -> Vec<(u16, u16)> {
        self.blocks
            .iter()
            .take(max_blocks)
            .map(|&(begin, end)| {
                (
                    begin.wrapping_sub(cum) as u16,
                    end.wrapping_sub(cum) as u16,
                )
            })
            .collect()
    }

    /// 정렬/비중첩이며 모든 block이 `cum` 위에 있는지
    pub fn is_consistent(&self, cum: u32) -> bool {
        let mut floor = cum;
        for &(begin, end) in &self.blocks {
            // 인접 block은 병합되어 있어야 하므로 최소 1칸 떨어져야 한다
            if !tsn_gt(begin, floor) || tsn_lt(end, begin) {
                return false;
            }
            floor = end.wrapping_add(1);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges_neighbours() {
        let mut gaps = SackGapSet::new();
        assert!(gaps.insert(12));
        assert!(gaps.insert(14));
        assert_eq!(gaps.len(), 2);
        assert!(gaps.insert(13));
        assert_eq!(gaps.iter().collect::<Vec<_>>(), vec![(12, 14)]);
        assert!(!gaps.insert(13));
        assert!(gaps.is_consistent(10));
    }

    #[test]
    fn test_remove_through_and_absorb() {
        let mut gaps = SackGapSet::new();
        for tsn in [5, 6, 7, 10, 11] {
            gaps.insert(tsn);
        }
        gaps.remove_through(6);
        assert_eq!(gaps.first(), Some((7, 7)));
        assert_eq!(gaps.absorb(6), Some(7));
        assert_eq!(gaps.absorb(7), None);
        assert_eq!(gaps.highest(), Some(11));
        assert!(gaps.is_consistent(7));
    }

    #[test]
    fn test_offsets_relative_to_cum() {
        let mut gaps = SackGapSet::new();
        for tsn in [102, 103, 106] {
            gaps.insert(tsn);
        }
        assert_eq!(gaps.to_offsets(100, 64), vec![(2, 3), (6, 6)]);
        assert_eq!(gaps.to_offsets(100, 1), vec![(2, 3)]);
    }

    #[test]
    fn test_wraparound() {
        let mut gaps = SackGapSet::new();
        gaps.insert(u32::MAX);
        gaps.insert(0);
        gaps.insert(2);
        assert_eq!(gaps.iter().collect::<Vec<_>>(), vec![(u32::MAX, 0), (2, 2)]);
        assert!(gaps.contains(0));
        assert!(gaps.is_consistent(u32::MAX - 2));
    }

    #[test]
    fn test_random_inserts_stay_consistent() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let cum = 1000u32;
        let mut gaps = SackGapSet::new();
        for _ in 0..500 {
            gaps.insert(cum + rng.gen_range(2..200));
            assert!(gaps.is_consistent(cum));
        }
    }
}
