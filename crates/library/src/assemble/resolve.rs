//! Choosing between fragments that disagree over the same bytes.

use crate::assemble::FragmentDescriptor;
use std::cmp::Reverse;
use tellus_archive::Interval;

/// Built-in policy for overlapping fragments with different content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConflictStrategy {
    /// Later `created_at`, then higher priority.
    #[default]
    PreferLatest,
    /// Longer coverage within the requested interval, then higher priority.
    PreferLargest,
    /// Higher priority, then later `created_at`.
    PreferExplicitPriority,
    /// Abort planning with [`FragmentConflict`](crate::error::ErrorKind::FragmentConflict).
    FailOnConflict,
}

/// Decision of a [`ConflictResolver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    KeepExisting,
    TakeIncoming,
    /// Fall back to the request's [`ConflictStrategy`].
    Defer,
    /// Fail planning with a fragment conflict.
    Abort,
}

/// Caller override consulted for every conflict while planning, before the
/// strategy. Never called while bytes are written.
pub trait ConflictResolver: Send + Sync {
    /// `existing` already covers `overlap`; `incoming` would replace it.
    fn resolve(&self, existing: &FragmentDescriptor, incoming: &FragmentDescriptor, overlap: Interval) -> Resolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&FragmentDescriptor, &FragmentDescriptor, Interval) -> Resolution + Send + Sync,
{
    fn resolve(&self, existing: &FragmentDescriptor, incoming: &FragmentDescriptor, overlap: Interval) -> Resolution {
        self(existing, incoming, overlap)
    }
}

/// Which side a strategy picks, `None` for [`ConflictStrategy::FailOnConflict`].
///
/// Each fragment comes with its coverage length within the requested
/// interval. Full ties go to the smaller archive id, then the smaller member
/// path, so the outcome never depends on input order.
pub(crate) fn prefers_incoming<'a>(
    strategy: ConflictStrategy,
    existing: (&'a FragmentDescriptor, u64),
    incoming: (&'a FragmentDescriptor, u64),
) -> Option<bool> {
    let rank = |(fragment, len): (&'a FragmentDescriptor, u64)| {
        let created = fragment.created_at.unix_timestamp_nanos();
        let priority = i128::from(fragment.priority);
        let primary = match strategy {
            ConflictStrategy::PreferLargest => [i128::from(len), priority],
            ConflictStrategy::PreferExplicitPriority => [priority, created],
            _ => [created, priority],
        };
        (primary, Reverse((&fragment.archive_id, &fragment.member)))
    };
    match strategy {
        ConflictStrategy::FailOnConflict => None,
        _ => Some(rank(existing) < rank(incoming)),
    }
}
