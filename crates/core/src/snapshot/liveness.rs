use std::sync::Arc;

use memcct_protocol::{Epoch, SharedStr};
use serde::{Deserialize, Serialize};

use super::alloc::fold_class_counts;
use super::{ClassStats, SnapshotError, now_millis, offline_methods};
use crate::builder::{FrozenCallGraph, MemoryCallGraphBuilder};
use crate::client::ProfilerClient;
use crate::model::{MethodIdTable, NodeId, RuntimeCct, SurvivingGenerationSet};
use crate::views::{BuildOptions, PresoTree};

/// Liveness-mode snapshot: live-object trees with birth epochs, plus the
/// per-class age and generation summaries derived from them.
#[derive(Debug, Serialize, Deserialize)]
pub struct LivenessSnapshot {
    time_taken: u64,
    graph: FrozenCallGraph,
    n_total_allocated: Vec<i64>,
    avg_object_age: Vec<f32>,
    max_surv_gen: Vec<i32>,
    dont_show_zero_live_obj_alloc_paths: bool,
    #[serde(skip, default = "offline_methods")]
    pub(super) methods: Arc<MethodIdTable>,
}

impl LivenessSnapshot {
    pub fn capture(
        builder: &MemoryCallGraphBuilder,
        client: &dyn ProfilerClient,
        dont_show_zero_live_obj_alloc_paths: bool,
    ) -> Result<LivenessSnapshot, SnapshotError> {
        let (graph, merged_index) = builder.freeze();
        let counts = client.allocated_objects_count_results()?;
        Ok(Self::from_frozen(
            graph,
            &merged_index,
            &counts,
            builder.methods().clone(),
            dont_show_zero_live_obj_alloc_paths,
        ))
    }

    pub fn from_frozen(
        mut graph: FrozenCallGraph,
        merged_index: &[usize],
        counts: &[i64],
        methods: Arc<MethodIdTable>,
        dont_show_zero_live_obj_alloc_paths: bool,
    ) -> LivenessSnapshot {
        let n_total_allocated = fold_class_counts(&mut graph, merged_index, counts);
        let (avg_object_age, max_surv_gen) = graph
            .roots
            .iter()
            .map(|roots| class_age_summary(&graph.cct, roots, graph.current_epoch))
            .unzip();
        tracing::debug!(
            classes = graph.n_classes(),
            current_epoch = graph.current_epoch,
            "liveness snapshot taken"
        );
        LivenessSnapshot {
            time_taken: now_millis(),
            graph,
            n_total_allocated,
            avg_object_age,
            max_surv_gen,
            dont_show_zero_live_obj_alloc_paths,
            methods,
        }
    }

    pub fn time_taken(&self) -> u64 {
        self.time_taken
    }

    pub fn class_names(&self) -> &[SharedStr] {
        &self.graph.class_names
    }

    pub fn graph(&self) -> &FrozenCallGraph {
        &self.graph
    }

    pub fn methods(&self) -> &Arc<MethodIdTable> {
        &self.methods
    }

    pub fn current_epoch(&self) -> Epoch {
        self.graph.current_epoch
    }

    pub fn dont_show_zero_live_obj_alloc_paths(&self) -> bool {
        self.dont_show_zero_live_obj_alloc_paths
    }

    pub fn avg_object_age(&self) -> &[f32] {
        &self.avg_object_age
    }

    pub fn max_surv_gen(&self) -> &[i32] {
        &self.max_surv_gen
    }

    pub fn n_total_allocated(&self) -> &[i64] {
        &self.n_total_allocated
    }

    pub fn class_stats(&self, class_id: usize) -> Option<ClassStats> {
        let totals = self.graph.totals.get(class_id)?;
        Some(ClassStats {
            objects: self.n_total_allocated.get(class_id).copied().unwrap_or(0),
            size: totals.tracked_live_size,
            live_objects: totals.tracked_live,
            tracked_allocs: totals.tracked_alloc,
            avg_object_age: self.avg_object_age.get(class_id).copied().unwrap_or(0.0),
            max_surv_gen: self.max_surv_gen.get(class_id).copied().unwrap_or(0),
        })
    }

    pub fn create_presentation_cct(&self, class_id: usize) -> Result<PresoTree, SnapshotError> {
        let options = BuildOptions {
            liveness: true,
            dont_show_zero_live_obj_alloc_paths: self.dont_show_zero_live_obj_alloc_paths,
            current_epoch: self.graph.current_epoch,
        };
        PresoTree::build(&self.graph, class_id, self.methods.clone(), options)
            .ok_or(SnapshotError::UnknownClass(class_id))
    }
}

/// Average age and number of distinct ages over every live object of one
/// class.
fn class_age_summary(cct: &RuntimeCct, roots: &[NodeId], current_epoch: Epoch) -> (f32, i32) {
    let mut gens = SurvivingGenerationSet::new();
    let mut live = 0u64;
    let mut age_sum = 0u64;
    let mut stack: Vec<NodeId> = roots.to_vec();
    while let Some(id) = stack.pop() {
        let node = cct.node(id);
        if let Some(epochs) = node.kind.epochs() {
            for row in epochs.rows() {
                let age = current_epoch.saturating_sub(row.epoch);
                gens.add_age(age);
                live += u64::from(row.live);
                age_sum += u64::from(row.live) * u64::from(age);
            }
        }
        stack.extend_from_slice(node.children.as_slice());
    }
    let avg = if live == 0 {
        0.0
    } else {
        (age_sum as f64 / live as f64) as f32
    };
    // Saturates at i32::MAX distinct ages.
    let distinct = i32::try_from(gens.total_no_of_ages()).unwrap_or(i32::MAX);
    (avg, distinct)
}
