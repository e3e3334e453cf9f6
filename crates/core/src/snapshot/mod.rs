//! Frozen per-class aggregates and call trees.
//!
//! A snapshot is immutable once taken and is shared between threads through
//! `Arc`. Presentation trees are built from it on demand, a fresh tree per
//! call.

mod alloc;
mod diff;
mod liveness;
mod sampled;

use std::io::{Read, Write};
use std::ops::{Add, Neg};
use std::sync::Arc;

use memcct_protocol::{MethodId, SharedStr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ClientError;
use crate::model::{MethodIdTable, MethodNames};
use crate::views::PresoTree;

pub use alloc::AllocSnapshot;
pub use diff::SnapshotDiff;
pub use liveness::LivenessSnapshot;
pub use sampled::SampledSnapshot;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("cannot diff a {left} snapshot against a {right} snapshot")]
    UnsupportedPairing { left: SnapshotKind, right: SnapshotKind },
    #[error("{0} is not supported on a diff snapshot")]
    UnsupportedOperation(&'static str),
    #[error("{0} snapshots carry no call tree")]
    NoCallTree(SnapshotKind),
    #[error("no class with index {0}")]
    UnknownClass(usize),
    #[error("snapshot format version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("profiler client: {0}")]
    Client(#[from] ClientError),
    #[error("snapshot json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Allocations,
    Liveness,
    Sampled,
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SnapshotKind::Allocations => "allocations",
            SnapshotKind::Liveness => "liveness",
            SnapshotKind::Sampled => "sampled heap",
        })
    }
}

/// One row of the per-class aggregate arrays. Which fields are populated
/// depends on the snapshot kind; the rest stay zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassStats {
    /// All allocations of the class (alloc, liveness) or instances (sampled).
    pub objects: i64,
    /// Allocated bytes (alloc), live bytes (liveness) or heap bytes (sampled).
    pub size: i64,
    pub live_objects: i64,
    pub tracked_allocs: i64,
    pub avg_object_age: f32,
    pub max_surv_gen: i32,
}

impl Neg for ClassStats {
    type Output = ClassStats;

    fn neg(self) -> ClassStats {
        ClassStats {
            objects: -self.objects,
            size: -self.size,
            live_objects: -self.live_objects,
            tracked_allocs: -self.tracked_allocs,
            avg_object_age: -self.avg_object_age,
            max_surv_gen: -self.max_surv_gen,
        }
    }
}

impl Add for ClassStats {
    type Output = ClassStats;

    fn add(self, rhs: ClassStats) -> ClassStats {
        ClassStats {
            objects: self.objects + rhs.objects,
            size: self.size + rhs.size,
            live_objects: self.live_objects + rhs.live_objects,
            tracked_allocs: self.tracked_allocs + rhs.tracked_allocs,
            avg_object_age: self.avg_object_age + rhs.avg_object_age,
            max_surv_gen: self.max_surv_gen + rhs.max_surv_gen,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemorySnapshot {
    Allocations(AllocSnapshot),
    Liveness(LivenessSnapshot),
    Sampled(SampledSnapshot),
}

impl MemorySnapshot {
    pub fn kind(&self) -> SnapshotKind {
        match self {
            MemorySnapshot::Allocations(_) => SnapshotKind::Allocations,
            MemorySnapshot::Liveness(_) => SnapshotKind::Liveness,
            MemorySnapshot::Sampled(_) => SnapshotKind::Sampled,
        }
    }

    /// Wall-clock time the snapshot was taken, in milliseconds.
    pub fn time_taken(&self) -> u64 {
        match self {
            MemorySnapshot::Allocations(s) => s.time_taken(),
            MemorySnapshot::Liveness(s) => s.time_taken(),
            MemorySnapshot::Sampled(s) => s.time_taken(),
        }
    }

    pub fn class_names(&self) -> &[SharedStr] {
        match self {
            MemorySnapshot::Allocations(s) => s.class_names(),
            MemorySnapshot::Liveness(s) => s.class_names(),
            MemorySnapshot::Sampled(s) => s.class_names(),
        }
    }

    pub fn n_profiled_classes(&self) -> usize {
        self.class_names().len()
    }

    /// Index of `name` in this snapshot's class table. `None` means the
    /// class was not tracked here, which is not an error.
    pub fn class_id(&self, name: &str) -> Option<usize> {
        self.class_names().iter().position(|n| n.as_str() == name)
    }

    pub fn class_stats(&self, class_id: usize) -> Option<ClassStats> {
        match self {
            MemorySnapshot::Allocations(s) => s.class_stats(class_id),
            MemorySnapshot::Liveness(s) => s.class_stats(class_id),
            MemorySnapshot::Sampled(s) => s.class_stats(class_id),
        }
    }

    /// Build a fresh presentation tree for one class.
    pub fn create_presentation_cct(&self, class_id: usize) -> Result<PresoTree, SnapshotError> {
        match self {
            MemorySnapshot::Allocations(s) => s.create_presentation_cct(class_id),
            MemorySnapshot::Liveness(s) => s.create_presentation_cct(class_id),
            MemorySnapshot::Sampled(_) => Err(SnapshotError::NoCallTree(SnapshotKind::Sampled)),
        }
    }

    fn methods(&self) -> Option<&Arc<MethodIdTable>> {
        match self {
            MemorySnapshot::Allocations(s) => Some(s.methods()),
            MemorySnapshot::Liveness(s) => Some(s.methods()),
            MemorySnapshot::Sampled(_) => None,
        }
    }

    fn install_methods(&mut self, methods: Arc<MethodIdTable>) {
        match self {
            MemorySnapshot::Allocations(s) => s.methods = methods,
            MemorySnapshot::Liveness(s) => s.methods = methods,
            MemorySnapshot::Sampled(_) => {}
        }
    }

    /// Serialize as JSON, method names included. Pending method ids are
    /// resolved first so the stored table is complete.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), SnapshotError> {
        let methods = match self.methods() {
            Some(table) => {
                table.resolve_pending();
                table.resolved_entries()
            }
            None => Vec::new(),
        };
        let stored = StoredSnapshotRef {
            version: FORMAT_VERSION,
            snapshot: self,
            methods,
        };
        serde_json::to_writer(writer, &stored)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: R) -> Result<MemorySnapshot, SnapshotError> {
        let stored: StoredSnapshot = serde_json::from_reader(reader)?;
        if stored.version != FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(stored.version));
        }
        let mut snapshot = stored.snapshot;
        snapshot.install_methods(Arc::new(MethodIdTable::from_resolved(stored.methods)));
        tracing::debug!(kind = %snapshot.kind(), classes = snapshot.n_profiled_classes(), "snapshot loaded");
        Ok(snapshot)
    }
}

#[derive(Serialize)]
struct StoredSnapshotRef<'a> {
    version: u32,
    snapshot: &'a MemorySnapshot,
    methods: Vec<(MethodId, MethodNames)>,
}

#[derive(Deserialize)]
struct StoredSnapshot {
    version: u32,
    snapshot: MemorySnapshot,
    methods: Vec<(MethodId, MethodNames)>,
}

fn offline_methods() -> Arc<MethodIdTable> {
    Arc::new(MethodIdTable::offline())
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
