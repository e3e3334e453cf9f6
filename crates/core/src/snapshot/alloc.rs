use std::sync::Arc;

use memcct_protocol::{ClassId, SharedStr};
use serde::{Deserialize, Serialize};

use super::{ClassStats, SnapshotError, now_millis, offline_methods};
use crate::builder::{FrozenCallGraph, MemoryCallGraphBuilder, placeholder_name};
use crate::client::ProfilerClient;
use crate::model::MethodIdTable;
use crate::views::{BuildOptions, PresoTree};

/// Allocation-mode snapshot: sampled allocation trees per class plus the
/// agent's full allocation counts.
#[derive(Debug, Serialize, Deserialize)]
pub struct AllocSnapshot {
    time_taken: u64,
    graph: FrozenCallGraph,
    objects_counts: Vec<i64>,
    #[serde(skip, default = "offline_methods")]
    pub(super) methods: Arc<MethodIdTable>,
}

impl AllocSnapshot {
    /// Freeze `builder` and fetch allocation counts from the agent.
    pub fn capture(
        builder: &MemoryCallGraphBuilder,
        client: &dyn ProfilerClient,
    ) -> Result<AllocSnapshot, SnapshotError> {
        let (graph, merged_index) = builder.freeze();
        let counts = client.allocated_objects_count_results()?;
        Ok(Self::from_frozen(graph, &merged_index, &counts, builder.methods().clone()))
    }

    /// Assemble a snapshot from an already frozen graph. `counts` is indexed
    /// by agent class id and folded through `merged_index`.
    pub fn from_frozen(
        mut graph: FrozenCallGraph,
        merged_index: &[usize],
        counts: &[i64],
        methods: Arc<MethodIdTable>,
    ) -> AllocSnapshot {
        let objects_counts = fold_class_counts(&mut graph, merged_index, counts);
        tracing::debug!(classes = graph.n_classes(), "allocation snapshot taken");
        AllocSnapshot {
            time_taken: now_millis(),
            graph,
            objects_counts,
            methods,
        }
    }

    pub fn time_taken(&self) -> u64 {
        self.time_taken
    }

    pub fn class_names(&self) -> &[SharedStr] {
        &self.graph.class_names
    }

    pub fn objects_counts(&self) -> &[i64] {
        &self.objects_counts
    }

    pub fn graph(&self) -> &FrozenCallGraph {
        &self.graph
    }

    pub fn methods(&self) -> &Arc<MethodIdTable> {
        &self.methods
    }

    pub fn class_stats(&self, class_id: usize) -> Option<ClassStats> {
        let totals = self.graph.totals.get(class_id)?;
        Some(ClassStats {
            objects: self.objects_counts.get(class_id).copied().unwrap_or(0),
            size: totals.alloc_size,
            ..ClassStats::default()
        })
    }

    pub fn create_presentation_cct(&self, class_id: usize) -> Result<PresoTree, SnapshotError> {
        let options = BuildOptions {
            liveness: false,
            dont_show_zero_live_obj_alloc_paths: false,
            current_epoch: self.graph.current_epoch,
        };
        PresoTree::build(&self.graph, class_id, self.methods.clone(), options)
            .ok_or(SnapshotError::UnknownClass(class_id))
    }
}

/// Fold per-agent-class counts into the merged class table. Counted classes
/// the builder never saw get a placeholder row with an empty tree.
pub(super) fn fold_class_counts(
    graph: &mut FrozenCallGraph,
    merged_index: &[usize],
    counts: &[i64],
) -> Vec<i64> {
    let mut folded = vec![0i64; graph.n_classes()];
    for (id, &count) in counts.iter().enumerate() {
        if let Some(&index) = merged_index.get(id) {
            folded[index] += count;
            continue;
        }
        let Ok(raw) = u16::try_from(id) else {
            tracing::warn!(class_id = id, "class id out of range in allocation counts");
            break;
        };
        if count == 0 {
            continue;
        }
        graph.class_names.push(placeholder_name(ClassId(raw)));
        graph.roots.push(Vec::new());
        graph.totals.push(Default::default());
        folded.push(count);
    }
    folded
}
