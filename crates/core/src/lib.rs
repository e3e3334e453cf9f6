//! Memory-profiling core: turns the agent's allocation and liveness frames
//! into per-class calling-context trees, snapshots and snapshot diffs.

pub mod builder;
pub mod client;
pub mod export;
pub mod history;
pub mod model;
pub mod parsers;
pub mod session;
pub mod settings;
pub mod snapshot;
pub mod views;

pub use builder::{ClassTotals, FrozenCallGraph, MemoryCallGraphBuilder};
pub use client::{ClientError, HeapHistogram, HistogramEntry, ProfilerClient};
pub use model::{MethodIdTable, MethodNames};
pub use session::ProfilingSession;
pub use settings::{MemorySettings, ProfilingMode};
pub use snapshot::{MemorySnapshot, SnapshotDiff, SnapshotError, SnapshotKind};
