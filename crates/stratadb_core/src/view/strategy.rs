//! View strategy traits: grouping, sorting, and range finding.

use crate::extension::{AccessLevel, StoredRow};
use std::cmp::Ordering;
use stratadb_codec::Value;

/// Decides which group a row belongs to, or excludes it from the view.
///
/// The grouping function must be pure: the same row always yields the same
/// group. `object` and `metadata` are populated according to
/// [`ViewGrouper::access`].
pub trait ViewGrouper: Send + Sync {
    /// The cheapest row representation the grouping function needs.
    fn access(&self) -> AccessLevel {
        AccessLevel::Row
    }

    /// Returns the row's group, or `None` to exclude it from the view.
    fn group(
        &self,
        collection: &str,
        key: &str,
        object: Option<&Value>,
        metadata: Option<&Value>,
    ) -> Option<String>;
}

/// Orders rows within a group.
///
/// Must impose a total order for deterministic view population; ties are
/// kept in insertion order.
pub trait ViewSorter: Send + Sync {
    /// The cheapest row representation the comparator needs.
    fn access(&self) -> AccessLevel {
        AccessLevel::Row
    }

    /// Compares two rows of `group`.
    fn compare(&self, group: &str, a: &StoredRow, b: &StoredRow) -> Ordering;
}

/// A monotonic predicate for binary-search range queries.
///
/// `compare` classifies a row as before (`Less`), inside (`Equal`), or
/// after (`Greater`) the target range. The classification must be
/// consistent with the view's sort order: rows before the range sort before
/// rows inside it, which sort before rows after it. Supplying a predicate
/// whose ordering disagrees with the view's comparator is an unchecked
/// precondition: the search stays in bounds and never fails, but the
/// returned range is unspecified.
pub trait ViewFind: Send + Sync {
    /// The cheapest row representation the predicate needs.
    fn access(&self) -> AccessLevel {
        AccessLevel::Row
    }

    /// Classifies a row relative to the target range.
    fn compare(&self, row: &StoredRow) -> Ordering;
}
