use std::collections::HashMap;
use std::sync::Arc;

use memcct_protocol::SharedStr;

use super::{ClassStats, MemorySnapshot, SnapshotError, SnapshotKind};
use crate::views::DiffTree;

/// Signed difference between two snapshots of the same kind, `right` minus
/// `left`.
///
/// The class table is the union of both sides: every class of `left` in its
/// original order, then the classes only `right` has. Classes whose delta is
/// zero stay in the table.
#[derive(Debug, Clone)]
pub struct SnapshotDiff {
    left: Arc<MemorySnapshot>,
    right: Arc<MemorySnapshot>,
    class_names: Vec<SharedStr>,
    deltas: Vec<ClassStats>,
    min_delta_size: i64,
    max_delta_size: i64,
}

impl SnapshotDiff {
    pub fn new(
        left: Arc<MemorySnapshot>,
        right: Arc<MemorySnapshot>,
    ) -> Result<SnapshotDiff, SnapshotError> {
        if left.kind() != right.kind() {
            return Err(SnapshotError::UnsupportedPairing {
                left: left.kind(),
                right: right.kind(),
            });
        }

        let mut index: HashMap<SharedStr, usize> = HashMap::new();
        let mut class_names = Vec::new();
        let mut deltas: Vec<ClassStats> = Vec::new();

        for (id, name) in left.class_names().iter().enumerate() {
            let stats = left.class_stats(id).unwrap_or_default();
            match index.get(name) {
                Some(&i) => deltas[i] = deltas[i] + -stats,
                None => {
                    index.insert(name.clone(), class_names.len());
                    class_names.push(name.clone());
                    deltas.push(-stats);
                }
            }
        }
        for (id, name) in right.class_names().iter().enumerate() {
            let stats = right.class_stats(id).unwrap_or_default();
            match index.get(name) {
                Some(&i) => deltas[i] = deltas[i] + stats,
                None => {
                    index.insert(name.clone(), class_names.len());
                    class_names.push(name.clone());
                    deltas.push(stats);
                }
            }
        }

        let (min_delta_size, max_delta_size) = delta_size_range(deltas.iter().map(|d| d.size));
        tracing::debug!(
            kind = %left.kind(),
            classes = class_names.len(),
            min_delta_size,
            max_delta_size,
            "snapshot diff computed"
        );
        Ok(SnapshotDiff {
            left,
            right,
            class_names,
            deltas,
            min_delta_size,
            max_delta_size,
        })
    }

    pub fn kind(&self) -> SnapshotKind {
        self.left.kind()
    }

    pub fn left(&self) -> &Arc<MemorySnapshot> {
        &self.left
    }

    pub fn right(&self) -> &Arc<MemorySnapshot> {
        &self.right
    }

    pub fn begin_time(&self) -> u64 {
        self.left.time_taken()
    }

    pub fn end_time(&self) -> u64 {
        self.right.time_taken()
    }

    pub fn class_names(&self) -> &[SharedStr] {
        &self.class_names
    }

    pub fn n_profiled_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn class_id(&self, name: &str) -> Option<usize> {
        self.class_names.iter().position(|n| n.as_str() == name)
    }

    pub fn class_delta(&self, class_id: usize) -> Option<&ClassStats> {
        self.deltas.get(class_id)
    }

    pub fn deltas(&self) -> &[ClassStats] {
        &self.deltas
    }

    /// Smallest per-class size delta, never above zero.
    pub fn min_delta_size(&self) -> i64 {
        self.min_delta_size
    }

    /// Largest per-class size delta, never below zero.
    pub fn max_delta_size(&self) -> i64 {
        self.max_delta_size
    }

    /// Delta tree of one class of this diff's table. A side that does not
    /// know the class contributes nothing.
    pub fn create_presentation_cct(&self, class_id: usize) -> Result<DiffTree, SnapshotError> {
        if self.kind() == SnapshotKind::Sampled {
            return Err(SnapshotError::NoCallTree(SnapshotKind::Sampled));
        }
        let name = self
            .class_names
            .get(class_id)
            .ok_or(SnapshotError::UnknownClass(class_id))?;
        let left = side_tree(&self.left, name)?;
        let right = side_tree(&self.right, name)?;
        DiffTree::build(left.as_ref(), right.as_ref()).ok_or(SnapshotError::UnknownClass(class_id))
    }

    pub fn write_to<W: std::io::Write>(&self, _writer: W) -> Result<(), SnapshotError> {
        Err(SnapshotError::UnsupportedOperation("write_to"))
    }

    pub fn read_from<R: std::io::Read>(_reader: R) -> Result<SnapshotDiff, SnapshotError> {
        Err(SnapshotError::UnsupportedOperation("read_from"))
    }
}

fn side_tree(
    snapshot: &MemorySnapshot,
    name: &str,
) -> Result<Option<crate::views::PresoTree>, SnapshotError> {
    snapshot
        .class_id(name)
        .map(|id| snapshot.create_presentation_cct(id))
        .transpose()
}

/// Range of size deltas, widened so that it always contains zero.
pub(crate) fn delta_size_range(sizes: impl Iterator<Item = i64>) -> (i64, i64) {
    let (mut min, mut max) = sizes.fold((i64::MAX, i64::MIN), |(lo, hi), s| (lo.min(s), hi.max(s)));
    if min > max {
        return (0, 0);
    }
    if min > 0 && max > 0 {
        min = 0;
    }
    if min < 0 && max < 0 {
        max = 0;
    }
    (min, max)
}
