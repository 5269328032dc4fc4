//! Assembly planning.
//!
//! Planning is pure: it sees only fragment descriptors and never touches
//! storage, so the same candidates always produce the same plan.

use crate::assemble::resolve::{ConflictResolver, ConflictStrategy, Resolution, prefers_incoming};
use crate::assemble::{AssemblyMode, FragmentDescriptor};
use crate::error::{ErrorKind, Result};
use std::path::{Path, PathBuf};
use tellus_archive::{ArchiveId, Checksum, Interval};
use tracing::{debug, instrument};

/// One fragment's contribution to the output, in absolute dataset offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanSegment {
    pub fragment: FragmentDescriptor,
    pub range: Interval,
}

impl PlanSegment {
    /// The segment's range in offsets of the fragment's member.
    pub fn member_range(&self) -> Interval {
        self.range.relative_to(self.fragment.coverage.start)
    }
}

/// How an overlap was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlapResolution {
    /// Both fragments hold the same bytes; the earlier segment was kept.
    Agreement,
    Resolver,
    Strategy(ConflictStrategy),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentOverlap {
    pub existing: ArchiveId,
    pub incoming: ArchiveId,
    pub range: Interval,
    pub winner: ArchiveId,
    pub resolved_by: OverlapResolution,
}

impl FragmentOverlap {
    pub fn is_conflict(&self) -> bool {
        self.resolved_by != OverlapResolution::Agreement
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PlanComplexity {
    /// One fragment covers everything.
    Trivial,
    /// Several disjoint fragments, no gaps.
    Simple,
    /// Overlaps were resolved, no gaps.
    Overlapping,
    /// Gaps remain.
    Partial,
}

/// Segments covering the requested interval in output order, with the
/// overlaps settled on the way and any gaps left.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssemblyPlan {
    pub dataset: PathBuf,
    pub interval: Interval,
    /// Non-overlapping and sorted by start.
    pub segments: Vec<PlanSegment>,
    pub overlaps: Vec<FragmentOverlap>,
    /// Candidates lying entirely inside territory already covered.
    pub skipped: Vec<FragmentDescriptor>,
    pub gaps: Vec<Interval>,
    pub complexity: PlanComplexity,
}

impl AssemblyPlan {
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }

    /// Union of the segment ranges.
    pub fn coverage(&self) -> Vec<Interval> {
        Interval::union(self.segments.iter().map(|s| s.range))
    }

    /// Distinct fragments used, in output order.
    pub fn fragments_used(&self) -> Vec<(ArchiveId, PathBuf)> {
        let mut used: Vec<(ArchiveId, PathBuf)> = Vec::new();
        for segment in &self.segments {
            let key = (segment.fragment.archive_id.clone(), segment.fragment.member.clone());
            if !used.contains(&key) {
                used.push(key);
            }
        }
        used
    }

    /// Digest of the dataset, interval and chosen segments. Plans that would
    /// write different bytes have different fingerprints.
    pub fn fingerprint(&self) -> Checksum {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.dataset.to_string_lossy().as_bytes());
        hasher.update(&self.interval.start.to_le_bytes());
        hasher.update(&self.interval.end.to_le_bytes());
        for segment in &self.segments {
            hasher.update(&[0]);
            hasher.update(segment.fragment.archive_id.as_str().as_bytes());
            hasher.update(&[0]);
            hasher.update(segment.fragment.member.to_string_lossy().as_bytes());
            hasher.update(&segment.range.start.to_le_bytes());
            hasher.update(&segment.range.end.to_le_bytes());
        }
        Checksum::from(hasher.finalize())
    }
}

/// Inputs to [`plan_assembly`] besides the candidates.
pub(crate) struct PlanRequest<'a> {
    pub(crate) dataset: &'a Path,
    pub(crate) interval: Interval,
    pub(crate) strategy: ConflictStrategy,
    pub(crate) mode: AssemblyMode,
    pub(crate) resolver: Option<&'a dyn ConflictResolver>,
}

struct Candidate {
    fragment: FragmentDescriptor,
    range: Interval,
}

/// Sweep the candidates left to right, building non-overlapping segments.
///
/// Fails with [`ErrorKind::FragmentConflict`] when a conflict cannot be
/// settled and, in [`AssemblyMode::Strict`], with
/// [`ErrorKind::IncompleteCoverage`] when gaps remain.
#[instrument(level = "debug", skip_all, fields(dataset = %request.dataset.display(), interval = %request.interval))]
pub(crate) fn plan_assembly(request: &PlanRequest<'_>, candidates: Vec<FragmentDescriptor>) -> Result<AssemblyPlan> {
    let interval = request.interval;
    if interval.is_empty() {
        exn::bail!(ErrorKind::InvalidRequest(format!("empty assembly interval {interval}")));
    }
    let mut candidates: Vec<Candidate> = candidates
        .into_iter()
        .filter_map(|fragment| {
            let range = fragment.coverage.intersection(&interval)?;
            Some(Candidate { fragment, range })
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.range
            .start
            .cmp(&b.range.start)
            .then(b.fragment.priority.cmp(&a.fragment.priority))
            .then_with(|| a.fragment.archive_id.cmp(&b.fragment.archive_id))
            .then_with(|| a.fragment.member.cmp(&b.fragment.member))
    });

    let mut segments: Vec<PlanSegment> = Vec::new();
    let mut overlaps = Vec::new();
    let mut skipped = Vec::new();
    let mut frontier = interval.start;
    for Candidate { fragment, range } in candidates {
        if range.end <= frontier {
            debug!(archive_id = %fragment.archive_id, %range, "Fragment adds no coverage");
            skipped.push(fragment);
            continue;
        }
        let mut pieces = vec![Interval::new(range.start.max(frontier), range.end)];
        if range.start < frontier {
            let overlap = Interval::new(range.start, frontier);
            for segment in segments.iter_mut() {
                let Some(shared) = segment.range.intersection(&overlap) else {
                    continue;
                };
                let (take, resolved_by) = settle(request, &segment.fragment, &fragment, shared)?;
                let winner = match take {
                    true => &fragment,
                    false => &segment.fragment,
                };
                debug!(winner = %winner.archive_id, range = %shared, ?resolved_by, "Settled overlap");
                overlaps.push(FragmentOverlap {
                    existing: segment.fragment.archive_id.clone(),
                    incoming: fragment.archive_id.clone(),
                    range: shared,
                    winner: winner.archive_id.clone(),
                    resolved_by,
                });
                if take {
                    // Segments end at or before the frontier, so the shared
                    // part is always the segment's tail.
                    segment.range = Interval::new(segment.range.start, shared.start);
                    pieces.push(shared);
                }
            }
            segments.retain(|segment| !segment.range.is_empty());
        }
        segments.extend(Interval::union(pieces).into_iter().map(|range| PlanSegment {
            fragment: fragment.clone(),
            range,
        }));
        segments.sort_by_key(|segment| segment.range.start);
        frontier = range.end;
    }

    let covered: Vec<Interval> = segments.iter().map(|s| s.range).collect();
    let gaps = interval.subtract(&covered);
    if request.mode == AssemblyMode::Strict && !gaps.is_empty() {
        exn::bail!(ErrorKind::IncompleteCoverage {
            dataset: request.dataset.to_path_buf(),
            gaps,
        });
    }
    let complexity = if !gaps.is_empty() {
        PlanComplexity::Partial
    } else if !overlaps.is_empty() {
        PlanComplexity::Overlapping
    } else if segments.len() == 1 {
        PlanComplexity::Trivial
    } else {
        PlanComplexity::Simple
    };
    Ok(AssemblyPlan {
        dataset: request.dataset.to_path_buf(),
        interval,
        segments,
        overlaps,
        skipped,
        gaps,
        complexity,
    })
}

/// Whether `incoming` takes `shared` from `existing`, and why.
fn settle(
    request: &PlanRequest<'_>,
    existing: &FragmentDescriptor,
    incoming: &FragmentDescriptor,
    shared: Interval,
) -> Result<(bool, OverlapResolution)> {
    if existing.agrees_with(incoming) {
        return Ok((false, OverlapResolution::Agreement));
    }
    let conflict = || ErrorKind::FragmentConflict {
        existing: existing.archive_id.clone(),
        incoming: incoming.archive_id.clone(),
        overlap: shared,
    };
    if let Some(resolver) = request.resolver {
        match resolver.resolve(existing, incoming, shared) {
            Resolution::KeepExisting => return Ok((false, OverlapResolution::Resolver)),
            Resolution::TakeIncoming => return Ok((true, OverlapResolution::Resolver)),
            Resolution::Abort => exn::bail!(conflict()),
            Resolution::Defer => {},
        }
    }
    let clipped = |fragment: &FragmentDescriptor| fragment.coverage.intersection(&request.interval).map_or(0, |i| i.len());
    match prefers_incoming(
        request.strategy,
        (existing, clipped(existing)),
        (incoming, clipped(incoming)),
    ) {
        Some(take) => Ok((take, OverlapResolution::Strategy(request.strategy))),
        None => exn::bail!(conflict()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::tests::fragment;
    use rstest::rstest;

    const DATASET: &str = "exp01/outdata/ocean.nc";

    fn plan(
        interval: Interval,
        strategy: ConflictStrategy,
        mode: AssemblyMode,
        candidates: Vec<FragmentDescriptor>,
    ) -> Result<AssemblyPlan> {
        let request = PlanRequest {
            dataset: Path::new(DATASET),
            interval,
            strategy,
            mode,
            resolver: None,
        };
        plan_assembly(&request, candidates)
    }

    fn layout(plan: &AssemblyPlan) -> Vec<(&str, u64, u64)> {
        plan.segments
            .iter()
            .map(|s| (s.fragment.archive_id.as_str(), s.range.start, s.range.end))
            .collect()
    }

    #[test]
    fn test_newer_fragment_wins_the_overlap() {
        let plan = plan(
            Interval::new(0, 150),
            ConflictStrategy::PreferLatest,
            AssemblyMode::Strict,
            vec![fragment("frag-1", 0, 100, 1), fragment("frag-2", 50, 150, 2)],
        )
        .unwrap();

        assert_eq!(layout(&plan), vec![("frag-1", 0, 50), ("frag-2", 50, 150)]);
        assert_eq!(plan.complexity, PlanComplexity::Overlapping);
        assert_eq!(plan.overlaps.len(), 1);
        assert_eq!(plan.overlaps[0].range, Interval::new(50, 100));
        assert_eq!(plan.overlaps[0].winner.as_str(), "frag-2");
        assert!(plan.is_complete());
        assert_eq!(plan.coverage(), vec![Interval::new(0, 150)]);
    }

    #[test]
    fn test_gap_fails_strict_and_is_reported_in_partial() {
        let candidates = vec![fragment("frag-1", 0, 50, 1), fragment("frag-2", 80, 120, 2)];
        let err = plan(
            Interval::new(0, 120),
            ConflictStrategy::PreferLatest,
            AssemblyMode::Strict,
            candidates.clone(),
        )
        .unwrap_err();
        assert_eq!(
            *err,
            ErrorKind::IncompleteCoverage {
                dataset: PathBuf::from(DATASET),
                gaps: vec![Interval::new(50, 80)],
            }
        );

        let plan = plan(
            Interval::new(0, 120),
            ConflictStrategy::PreferLatest,
            AssemblyMode::Partial,
            candidates,
        )
        .unwrap();
        assert_eq!(plan.gaps, vec![Interval::new(50, 80)]);
        assert_eq!(plan.complexity, PlanComplexity::Partial);
        assert_eq!(layout(&plan), vec![("frag-1", 0, 50), ("frag-2", 80, 120)]);
    }

    #[test]
    fn test_agreeing_fragments_keep_the_earlier_segment() {
        let digest = Checksum::of(b"ocean v1");
        let plan = plan(
            Interval::new(0, 150),
            ConflictStrategy::FailOnConflict,
            AssemblyMode::Strict,
            vec![
                fragment("frag-1", 0, 100, 1).with_source_digest(digest.clone()),
                fragment("frag-2", 50, 150, 2).with_source_digest(digest),
            ],
        )
        .unwrap();

        assert_eq!(layout(&plan), vec![("frag-1", 0, 100), ("frag-2", 100, 150)]);
        assert_eq!(plan.overlaps[0].resolved_by, OverlapResolution::Agreement);
        assert!(!plan.overlaps[0].is_conflict());
    }

    #[rstest]
    #[case::strict(AssemblyMode::Strict)]
    #[case::partial(AssemblyMode::Partial)]
    fn test_fail_on_conflict_aborts_in_every_mode(#[case] mode: AssemblyMode) {
        let err = plan(
            Interval::new(0, 200),
            ConflictStrategy::FailOnConflict,
            mode,
            vec![fragment("frag-1", 0, 100, 1), fragment("frag-2", 50, 150, 2)],
        )
        .unwrap_err();
        assert_eq!(
            *err,
            ErrorKind::FragmentConflict {
                existing: "frag-1".parse().unwrap(),
                incoming: "frag-2".parse().unwrap(),
                overlap: Interval::new(50, 100),
            }
        );
    }

    #[rstest]
    #[case::latest(ConflictStrategy::PreferLatest, vec![("frag-a", 0, 20), ("frag-c", 20, 120)])]
    #[case::largest(ConflictStrategy::PreferLargest, vec![("frag-a", 0, 20), ("frag-c", 20, 120)])]
    #[case::priority(ConflictStrategy::PreferExplicitPriority, vec![("frag-a", 0, 60), ("frag-c", 60, 120)])]
    fn test_strategies_over_three_fragments(#[case] strategy: ConflictStrategy, #[case] expected: Vec<(&str, u64, u64)>) {
        let candidates = vec![
            fragment("frag-a", 0, 60, 1).with_priority(2),
            fragment("frag-b", 40, 100, 2).with_priority(1),
            fragment("frag-c", 20, 120, 3),
        ];
        let plan = plan(Interval::new(0, 120), strategy, AssemblyMode::Strict, candidates).unwrap();
        assert_eq!(layout(&plan), expected);
        assert_eq!(
            plan.skipped.iter().map(|f| f.archive_id.as_str()).collect::<Vec<_>>(),
            vec!["frag-b"]
        );
    }

    #[test]
    fn test_plans_do_not_depend_on_candidate_order() {
        let candidates = vec![
            fragment("frag-a", 0, 60, 1),
            fragment("frag-b", 40, 100, 2),
            fragment("frag-c", 20, 120, 3),
            fragment("frag-d", 110, 200, 1),
        ];
        let forward = plan(
            Interval::new(0, 200),
            ConflictStrategy::PreferLatest,
            AssemblyMode::Strict,
            candidates.clone(),
        )
        .unwrap();
        let reversed = plan(
            Interval::new(0, 200),
            ConflictStrategy::PreferLatest,
            AssemblyMode::Strict,
            candidates.into_iter().rev().collect(),
        )
        .unwrap();
        assert_eq!(forward, reversed);
        assert_eq!(forward.fingerprint(), reversed.fingerprint());
    }

    #[test]
    fn test_complexity() {
        let single = plan(
            Interval::new(0, 100),
            ConflictStrategy::PreferLatest,
            AssemblyMode::Strict,
            vec![fragment("frag-1", 0, 100, 1), fragment("frag-2", 10, 90, 2)],
        )
        .unwrap();
        assert_eq!(single.complexity, PlanComplexity::Trivial);
        assert_eq!(single.skipped.len(), 1);

        let disjoint = plan(
            Interval::new(0, 100),
            ConflictStrategy::PreferLatest,
            AssemblyMode::Strict,
            vec![fragment("frag-2", 50, 100, 2), fragment("frag-1", 0, 50, 1)],
        )
        .unwrap();
        assert_eq!(disjoint.complexity, PlanComplexity::Simple);
        assert_eq!(layout(&disjoint), vec![("frag-1", 0, 50), ("frag-2", 50, 100)]);
    }

    #[test]
    fn test_candidates_are_clipped_to_the_interval() {
        let plan = plan(
            Interval::new(30, 80),
            ConflictStrategy::PreferLatest,
            AssemblyMode::Strict,
            vec![fragment("frag-1", 0, 100, 1), fragment("frag-2", 200, 300, 2)],
        )
        .unwrap();
        assert_eq!(layout(&plan), vec![("frag-1", 30, 80)]);
        assert_eq!(plan.segments[0].member_range(), Interval::new(30, 80));
        assert_eq!(plan.fragments_used().len(), 1);
    }

    #[test]
    fn test_member_range_is_relative_to_the_fragment() {
        let plan = plan(
            Interval::new(0, 150),
            ConflictStrategy::PreferLatest,
            AssemblyMode::Strict,
            vec![fragment("frag-1", 0, 100, 1), fragment("frag-2", 50, 150, 1).with_priority(1)],
        )
        .unwrap();
        assert_eq!(plan.segments[1].member_range(), Interval::new(0, 100));
    }

    #[rstest]
    #[case::keep(Resolution::KeepExisting, Ok(vec![("frag-1", 0, 100), ("frag-2", 100, 150)]))]
    #[case::take(Resolution::TakeIncoming, Ok(vec![("frag-1", 0, 50), ("frag-2", 50, 150)]))]
    #[case::defer(Resolution::Defer, Ok(vec![("frag-1", 0, 100), ("frag-2", 100, 150)]))]
    #[case::abort(Resolution::Abort, Err(()))]
    fn test_resolver_overrides_the_strategy(
        #[case] resolution: Resolution,
        #[case] expected: std::result::Result<Vec<(&str, u64, u64)>, ()>,
    ) {
        let resolver = move |_: &FragmentDescriptor, _: &FragmentDescriptor, _: Interval| resolution;
        let request = PlanRequest {
            dataset: Path::new(DATASET),
            interval: Interval::new(0, 150),
            strategy: ConflictStrategy::PreferExplicitPriority,
            mode: AssemblyMode::Strict,
            resolver: Some(&resolver),
        };
        // Explicit priority favours frag-1, so only the resolver can hand the
        // overlap to frag-2.
        let candidates = vec![fragment("frag-1", 0, 100, 1).with_priority(1), fragment("frag-2", 50, 150, 2)];
        match (plan_assembly(&request, candidates), expected) {
            (Ok(plan), Ok(expected)) => assert_eq!(layout(&plan), expected),
            (Err(err), Err(())) => assert!(matches!(&*err, ErrorKind::FragmentConflict { .. })),
            (outcome, expected) => panic!("unexpected outcome {outcome:?}, expected {expected:?}"),
        }
    }

    #[test]
    fn test_empty_interval_is_rejected() {
        let err = plan(
            Interval::new(10, 10),
            ConflictStrategy::PreferLatest,
            AssemblyMode::Partial,
            vec![fragment("frag-1", 0, 100, 1)],
        )
        .unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidRequest(_)));
    }

    #[test]
    fn test_no_candidates_leaves_one_gap() {
        let plan = plan(Interval::new(0, 100), ConflictStrategy::PreferLatest, AssemblyMode::Partial, vec![]).unwrap();
        assert_eq!(plan.gaps, vec![Interval::new(0, 100)]);
        assert!(plan.segments.is_empty());
    }
}
