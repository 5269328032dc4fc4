//! Coverage intervals and date ranges.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use time::OffsetDateTime;

/// Half-open range `[start, end)` of offsets within a logical dataset.
///
/// An interval whose `end` precedes its `start` is normalized to the empty
/// interval at `start`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub const fn new(start: u64, end: u64) -> Self {
        let end = if end < start { start } else { end };
        Self { start, end }
    }

    /// `[start, start + len)`, saturating at `u64::MAX`.
    pub const fn with_len(start: u64, len: u64) -> Self {
        Self::new(start, start.saturating_add(len))
    }

    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `other` lies entirely within `self`. Empty intervals are
    /// contained everywhere.
    pub const fn contains(&self, other: &Interval) -> bool {
        other.is_empty() || (self.start <= other.start && other.end <= self.end)
    }

    pub const fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersection(&self, other: &Interval) -> Option<Interval> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Interval { start, end })
    }

    /// The parts of `self` not covered by any interval in `covered`.
    ///
    /// The result is sorted and contains no empty intervals.
    pub fn subtract(&self, covered: &[Interval]) -> Vec<Interval> {
        let mut pieces: Vec<Interval> = covered.iter().filter_map(|c| self.intersection(c)).collect();
        pieces.sort();
        let mut gaps = Vec::new();
        let mut cursor = self.start;
        for piece in pieces {
            if piece.start > cursor {
                gaps.push(Interval::new(cursor, piece.start));
            }
            cursor = cursor.max(piece.end);
        }
        if cursor < self.end {
            gaps.push(Interval::new(cursor, self.end));
        }
        gaps
    }

    /// Merge overlapping or touching intervals into a sorted disjoint list.
    pub fn union(intervals: impl IntoIterator<Item = Interval>) -> Vec<Interval> {
        let mut sorted: Vec<Interval> = intervals.into_iter().filter(|i| !i.is_empty()).collect();
        sorted.sort();
        let mut merged: Vec<Interval> = Vec::with_capacity(sorted.len());
        for interval in sorted {
            match merged.last_mut() {
                Some(last) if interval.start <= last.end => last.end = last.end.max(interval.end),
                _ => merged.push(interval),
            }
        }
        merged
    }

    /// Translate an absolute interval into offsets relative to `origin`.
    pub fn relative_to(&self, origin: u64) -> Interval {
        Interval::new(self.start.saturating_sub(origin), self.end.saturating_sub(origin))
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Inclusive range of timestamps, open-ended on either side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
}

impl DateRange {
    pub fn new(start: impl Into<Option<OffsetDateTime>>, end: impl Into<Option<OffsetDateTime>>) -> Self {
        Self { start: start.into(), end: end.into() }
    }

    /// The smallest range spanning every timestamp, or `None` when empty.
    pub fn spanning(times: impl IntoIterator<Item = OffsetDateTime>) -> Option<Self> {
        times.into_iter().fold(None, |range: Option<DateRange>, t| {
            Some(match range {
                None => DateRange::new(t, t),
                Some(r) => DateRange::new(r.start.map(|s| s.min(t)), r.end.map(|e| e.max(t))),
            })
        })
    }

    pub fn contains(&self, when: OffsetDateTime) -> bool {
        self.start.is_none_or(|start| when >= start) && self.end.is_none_or(|end| when <= end)
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        let starts_before_other_ends = match (self.start, other.end) {
            (Some(start), Some(end)) => start <= end,
            _ => true,
        };
        let ends_after_other_starts = match (self.end, other.start) {
            (Some(end), Some(start)) => end >= start,
            _ => true,
        };
        starts_before_other_ends && ends_after_other_starts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::macros::datetime;

    #[test]
    fn test_new_normalizes_reversed() {
        let interval = Interval::new(10, 5);
        assert!(interval.is_empty());
        assert_eq!(interval.start, 10);
    }

    #[rstest]
    #[case(Interval::new(0, 100), Interval::new(50, 150), Some(Interval::new(50, 100)))]
    #[case(Interval::new(0, 50), Interval::new(50, 100), None)]
    #[case(Interval::new(10, 20), Interval::new(0, 100), Some(Interval::new(10, 20)))]
    fn test_intersection(#[case] a: Interval, #[case] b: Interval, #[case] expected: Option<Interval>) {
        assert_eq!(a.intersection(&b), expected);
        assert_eq!(a.overlaps(&b), expected.is_some());
    }

    #[test]
    fn test_subtract_reports_gaps() {
        let requested = Interval::new(0, 120);
        let gaps = requested.subtract(&[Interval::new(0, 50), Interval::new(80, 120)]);
        assert_eq!(gaps, vec![Interval::new(50, 80)]);
        let gaps = requested.subtract(&[Interval::new(10, 20)]);
        assert_eq!(gaps, vec![Interval::new(0, 10), Interval::new(20, 120)]);
        assert!(requested.subtract(&[Interval::new(0, 200)]).is_empty());
    }

    #[test]
    fn test_union_merges_touching() {
        let merged = Interval::union([Interval::new(50, 80), Interval::new(0, 50), Interval::new(90, 95)]);
        assert_eq!(merged, vec![Interval::new(0, 80), Interval::new(90, 95)]);
    }

    #[test]
    fn test_display() {
        assert_eq!(Interval::new(50, 80).to_string(), "[50, 80)");
    }

    #[test]
    fn test_date_range_contains_open_ended() {
        let range = DateRange::new(datetime!(2024-01-01 0:00 UTC), None);
        assert!(range.contains(datetime!(2030-01-01 0:00 UTC)));
        assert!(!range.contains(datetime!(2023-12-31 23:59 UTC)));
        assert!(DateRange::default().contains(datetime!(1900-01-01 0:00 UTC)));
    }

    #[test]
    fn test_date_range_spanning_and_overlap() {
        let range = DateRange::spanning([
            datetime!(2024-03-01 0:00 UTC),
            datetime!(2024-01-01 0:00 UTC),
            datetime!(2024-02-01 0:00 UTC),
        ])
        .unwrap();
        assert_eq!(range.start, Some(datetime!(2024-01-01 0:00 UTC)));
        assert_eq!(range.end, Some(datetime!(2024-03-01 0:00 UTC)));
        assert!(range.overlaps(&DateRange::new(datetime!(2024-02-15 0:00 UTC), None)));
        assert!(!range.overlaps(&DateRange::new(None, datetime!(2023-06-01 0:00 UTC))));
        assert!(DateRange::spanning([]).is_none());
    }

    #[test]
    fn test_date_range_serde_roundtrip() {
        let range = DateRange::new(datetime!(2024-01-01 0:00 UTC), None);
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(serde_json::from_str::<DateRange>(&json).unwrap(), range);
    }
}
