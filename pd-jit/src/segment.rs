use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::{DeclineReason, JitError, JitResult};
use crate::gate::NativeEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(usize);

impl SegmentId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A bytecode range replaced by native code. Immutable once committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub id: SegmentId,
    /// Bytecode addresses covered, see [`BytecodeSource::base_address`].
    ///
    /// [`BytecodeSource::base_address`]: crate::bytecode::BytecodeSource::base_address
    pub bytecode: Range<usize>,
    /// Offsets of the native code inside the code buffer.
    pub code: Range<usize>,
    pub entry: NativeEntry,
}

impl Segment {
    pub fn bytecode_start(&self) -> usize {
        self.bytecode.start
    }

    pub fn bytecode_end(&self) -> usize {
        self.bytecode.end
    }

    pub fn code_len(&self) -> usize {
        self.code.end - self.code.start
    }
}

/// Committed segments, stored in insertion order and indexed by bytecode start.
#[derive(Debug, Default)]
pub struct SegmentTable {
    segments: Vec<Segment>,
    by_start: BTreeMap<usize, SegmentId>,
}

impl SegmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Segment covering `pc`, if any.
    pub fn lookup(&self, pc: usize) -> Option<&Segment> {
        let (_, id) = self.by_start.range(..=pc).next_back()?;
        let segment = self.segments.get(id.0)?;
        segment.bytecode.contains(&pc).then_some(segment)
    }

    /// Segment starting exactly at `pc`.
    pub fn starting_at(&self, pc: usize) -> Option<&Segment> {
        let id = self.by_start.get(&pc)?;
        self.segments.get(id.0)
    }

    /// Start of the first segment beginning after `pc`.
    pub fn next_start_after(&self, pc: usize) -> Option<usize> {
        self.by_start
            .range(pc.saturating_add(1)..)
            .next()
            .map(|(start, _)| *start)
    }

    pub fn insert(
        &mut self,
        bytecode: Range<usize>,
        code: Range<usize>,
        entry: NativeEntry,
    ) -> JitResult<SegmentId> {
        if bytecode.is_empty() {
            return Err(JitError::Declined {
                pc: bytecode.start,
                reason: DeclineReason::EmptyRange,
            });
        }
        if let Some(existing) = self.first_overlap(&bytecode) {
            return Err(JitError::Overlap {
                new: bytecode,
                existing: existing.bytecode.clone(),
            });
        }
        let id = SegmentId(self.segments.len());
        self.by_start.insert(bytecode.start, id);
        self.segments.push(Segment {
            id,
            bytecode,
            code,
            entry,
        });
        debug_assert_eq!(self.segments.len(), self.by_start.len());
        Ok(id)
    }

    pub fn get(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id.0)
    }

    /// Segments in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn first_overlap(&self, range: &Range<usize>) -> Option<&Segment> {
        let before = self
            .by_start
            .range(..=range.start)
            .next_back()
            .and_then(|(_, id)| self.segments.get(id.0))
            .filter(|segment| segment.bytecode.end > range.start);
        if before.is_some() {
            return before;
        }
        self.by_start
            .range(range.start..)
            .next()
            .and_then(|(_, id)| self.segments.get(id.0))
            .filter(|segment| segment.bytecode.start < range.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: usize) -> NativeEntry {
        NativeEntry::new(addr as *const u8)
    }

    #[test]
    fn lookup_covers_half_open_ranges() {
        let mut table = SegmentTable::new();
        table.insert(10..20, 0..32, entry(0x1000)).expect("insert");
        assert!(table.lookup(9).is_none());
        assert_eq!(table.lookup(10).map(|s| s.bytecode.clone()), Some(10..20));
        assert_eq!(table.lookup(19).map(|s| s.bytecode.clone()), Some(10..20));
        assert!(table.lookup(20).is_none());
    }

    #[test]
    fn adjacent_segments_do_not_overlap() {
        let mut table = SegmentTable::new();
        table.insert(10..20, 0..16, entry(0x10)).expect("first");
        table.insert(20..30, 16..32, entry(0x20)).expect("second");
        table.insert(0..10, 32..48, entry(0x30)).expect("third");
        assert_eq!(table.lookup(20).map(|s| s.id.index()), Some(1));
        assert_eq!(table.next_start_after(10), Some(20));
        assert_eq!(table.next_start_after(0), Some(10));
        assert_eq!(table.next_start_after(20), None);
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut table = SegmentTable::new();
        table.insert(10..20, 0..16, entry(0x10)).expect("insert");
        for range in [5..11, 19..25, 12..14, 0..40, 10..20] {
            let err = table
                .insert(range.clone(), 16..32, entry(0x20))
                .expect_err("overlap");
            assert_eq!(
                err,
                JitError::Overlap {
                    new: range,
                    existing: 10..20
                }
            );
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn iteration_follows_insertion_order() {
        let mut table = SegmentTable::new();
        table.insert(40..50, 0..8, entry(1)).expect("insert");
        table.insert(0..10, 8..16, entry(2)).expect("insert");
        table.insert(20..30, 16..24, entry(3)).expect("insert");
        let starts: Vec<usize> = table.iter().map(|s| s.bytecode.start).collect();
        assert_eq!(starts, vec![40, 0, 20]);
        assert_eq!(
            table.starting_at(20).map(|s| s.entry),
            Some(entry(3))
        );
        assert!(table.starting_at(21).is_none());
    }

    #[test]
    fn empty_range_is_declined() {
        let mut table = SegmentTable::new();
        assert!(matches!(
            table.insert(5..5, 0..0, entry(0)),
            Err(JitError::Declined {
                reason: DeclineReason::EmptyRange,
                ..
            })
        ));
        assert!(table.is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_ranges() -> impl Strategy<Value = Vec<(usize, usize)>> {
            proptest::collection::vec((0usize..200, 0usize..24), 0..40)
        }

        proptest! {
            /// Whatever gets inserted, committed ranges stay pairwise disjoint.
            #[test]
            fn committed_ranges_never_overlap(ranges in arb_ranges()) {
                let mut table = SegmentTable::new();
                for (start, len) in ranges {
                    let _ = table.insert(start..start + len, 0..1, entry(start));
                }
                let mut committed: Vec<Range<usize>> =
                    table.iter().map(|s| s.bytecode.clone()).collect();
                committed.sort_by_key(|r| r.start);
                for pair in committed.windows(2) {
                    prop_assert!(pair[0].end <= pair[1].start, "{:?} overlaps {:?}", pair[0], pair[1]);
                }
            }

            /// `lookup` agrees with a linear scan over every segment.
            #[test]
            fn lookup_matches_linear_scan(ranges in arb_ranges(), probes in proptest::collection::vec(0usize..230, 1..50)) {
                let mut table = SegmentTable::new();
                for (start, len) in ranges {
                    let _ = table.insert(start..start + len, 0..1, entry(start));
                }
                for pc in probes {
                    let expected = table.iter().find(|s| s.bytecode.contains(&pc)).map(|s| s.id);
                    prop_assert_eq!(table.lookup(pc).map(|s| s.id), expected);
                    let starts_here = table.iter().find(|s| s.bytecode.start == pc).map(|s| s.id);
                    prop_assert_eq!(table.starting_at(pc).map(|s| s.id), starts_here);
                }
            }
        }
    }
}
