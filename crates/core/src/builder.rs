//! Threads decoded allocation records into the run-time CCT.

use std::collections::HashMap;
use std::sync::Arc;

use memcct_protocol::{
    AllocStackTrace, ClassId, Epoch, GcHappened, LivenessStackTrace, MethodId, ObjectId, SharedStr,
};
use serde::{Deserialize, Serialize};

use crate::model::{MethodIdTable, NodeId, ROOT_METHOD_ID, RuntimeCct};
use crate::parsers::{FrameListener, ListenerError};

/// Per-class counters maintained alongside the trees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTotals {
    /// Allocation records (with stack) seen for the class.
    pub sampled_allocs: i64,
    /// Bytes of those allocations.
    pub alloc_size: i64,
    pub tracked_alloc: i64,
    pub tracked_live: i64,
    pub tracked_live_size: i64,
}

impl ClassTotals {
    fn add(&mut self, other: &ClassTotals) {
        self.sampled_allocs += other.sampled_allocs;
        self.alloc_size += other.alloc_size;
        self.tracked_alloc += other.tracked_alloc;
        self.tracked_live += other.tracked_live;
        self.tracked_live_size += other.tracked_live_size;
    }
}

#[derive(Debug, Default)]
struct ClassSlot {
    name: Option<SharedStr>,
    root: Option<NodeId>,
    totals: ClassTotals,
}

#[derive(Debug, Clone, Copy)]
struct LiveObject {
    node: NodeId,
    size: u64,
}

/// Frozen copy of the builder state. Classes sharing a name (a class
/// re-instrumented under a new id) are already merged: their totals are
/// summed and their trees listed side by side in `roots`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FrozenCallGraph {
    pub cct: RuntimeCct,
    pub class_names: Vec<SharedStr>,
    pub roots: Vec<Vec<NodeId>>,
    pub totals: Vec<ClassTotals>,
    pub current_epoch: Epoch,
}

impl FrozenCallGraph {
    pub fn n_classes(&self) -> usize {
        self.class_names.len()
    }
}

/// Single-writer builder of allocation and liveness trees, one tree per
/// class. Feed it from exactly one thread in buffer order.
#[derive(Debug)]
pub struct MemoryCallGraphBuilder {
    cct: RuntimeCct,
    classes: Vec<ClassSlot>,
    live_objects: HashMap<ObjectId, LiveObject>,
    current_epoch: Epoch,
    methods: Arc<MethodIdTable>,
}

impl MemoryCallGraphBuilder {
    pub fn new(methods: Arc<MethodIdTable>) -> Self {
        Self {
            cct: RuntimeCct::new(),
            classes: Vec::new(),
            live_objects: HashMap::new(),
            current_epoch: 0,
            methods,
        }
    }

    pub fn methods(&self) -> &Arc<MethodIdTable> {
        &self.methods
    }

    pub fn define_class(&mut self, class_id: ClassId, name: impl Into<SharedStr>) {
        self.slot(class_id).name = Some(name.into());
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn class_name(&self, class_id: ClassId) -> SharedStr {
        self.classes
            .get(class_id.index())
            .and_then(|slot| slot.name.clone())
            .unwrap_or_else(|| placeholder_name(class_id))
    }

    pub fn totals(&self, class_id: ClassId) -> ClassTotals {
        self.classes
            .get(class_id.index())
            .map(|slot| slot.totals)
            .unwrap_or_default()
    }

    /// Largest birth epoch seen so far.
    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    pub fn live_object_count(&self) -> usize {
        self.live_objects.len()
    }

    pub fn cct(&self) -> &RuntimeCct {
        &self.cct
    }

    pub fn class_root(&self, class_id: ClassId) -> Option<NodeId> {
        self.classes.get(class_id.index()).and_then(|slot| slot.root)
    }

    pub fn record_alloc(&mut self, record: &AllocStackTrace) {
        let node = self.terminal_for_path(record.class_id, &record.method_ids);
        self.cct.record_allocation(node, record.object_size);
        let totals = &mut self.slot(record.class_id).totals;
        totals.sampled_allocs += 1;
        totals.alloc_size += size_as_i64(record.object_size);
    }

    pub fn record_liveness(&mut self, record: &LivenessStackTrace) {
        let class_id = record.class_id();
        let epoch = record.object_id.epoch();
        let node = self.terminal_for_path(class_id, &record.method_ids);
        self.cct.add_live_object(node, epoch, record.object_size);
        self.current_epoch = self.current_epoch.max(epoch);

        let previous = self.live_objects.insert(
            record.object_id,
            LiveObject {
                node,
                size: record.object_size,
            },
        );
        if previous.is_some() {
            tracing::warn!(object_id = record.object_id.0, "object id reported live twice");
        }

        let totals = &mut self.slot(class_id).totals;
        totals.tracked_alloc += 1;
        totals.tracked_live += 1;
        totals.tracked_live_size += size_as_i64(record.object_size);
    }

    /// Returns false for objects this builder never saw allocated.
    pub fn record_gc(&mut self, record: GcHappened) -> bool {
        let Some(object) = self.live_objects.remove(&record.object_id) else {
            tracing::debug!(object_id = record.object_id.0, "gc of untracked object");
            return false;
        };
        let epoch = record.object_id.epoch();
        if !self.cct.remove_live_object(object.node, epoch, object.size) {
            tracing::warn!(object_id = record.object_id.0, epoch, "live epoch missing on node");
        }
        let totals = &mut self.slot(record.object_id.class_id()).totals;
        totals.tracked_live -= 1;
        totals.tracked_live_size -= size_as_i64(object.size);
        true
    }

    /// Drop all trees, counters and tracked objects. Class names survive,
    /// the agent does not re-announce them.
    pub fn reset(&mut self) {
        tracing::debug!(nodes = self.cct.len(), "resetting collectors");
        self.cct.clear();
        self.live_objects.clear();
        self.current_epoch = 0;
        for slot in &mut self.classes {
            slot.root = None;
            slot.totals = ClassTotals::default();
        }
    }

    /// Deep copy of the current state for a snapshot.
    ///
    /// Also returns, per class id, the merged class index it landed in.
    pub fn freeze(&self) -> (FrozenCallGraph, Vec<usize>) {
        let mut by_name: HashMap<SharedStr, usize> = HashMap::new();
        let mut class_names = Vec::new();
        let mut totals: Vec<ClassTotals> = Vec::new();
        let mut source_roots: Vec<Vec<NodeId>> = Vec::new();
        let mut merged_index = Vec::with_capacity(self.classes.len());

        for (id, slot) in self.classes.iter().enumerate() {
            let name = slot
                .name
                .clone()
                .unwrap_or_else(|| placeholder_name(ClassId(id as u16)));
            let index = *by_name.entry(name.clone()).or_insert_with(|| {
                class_names.push(name);
                totals.push(ClassTotals::default());
                source_roots.push(Vec::new());
                class_names.len() - 1
            });
            totals[index].add(&slot.totals);
            source_roots[index].extend(slot.root);
            merged_index.push(index);
        }

        let flat: Vec<NodeId> = source_roots.iter().flatten().copied().collect();
        let (cct, copied) = self.cct.deep_copy(&flat);
        let mut copied = copied.into_iter();
        let roots = source_roots
            .iter()
            .map(|ids| ids.iter().filter_map(|_| copied.next()).collect())
            .collect();

        let frozen = FrozenCallGraph {
            cct,
            class_names,
            roots,
            totals,
            current_epoch: self.current_epoch,
        };
        (frozen, merged_index)
    }

    fn slot(&mut self, class_id: ClassId) -> &mut ClassSlot {
        let index = class_id.index();
        if index >= self.classes.len() {
            self.classes.resize_with(index + 1, ClassSlot::default);
        }
        &mut self.classes[index]
    }

    fn terminal_for_path(&mut self, class_id: ClassId, method_ids: &[MethodId]) -> NodeId {
        let root = match self.slot(class_id).root {
            Some(root) => root,
            None => {
                let root = self.cct.add_root(ROOT_METHOD_ID);
                self.slot(class_id).root = Some(root);
                root
            }
        };
        method_ids.iter().fold(root, |node, &method_id| {
            self.methods.check_method_id(method_id);
            self.cct.child_or_insert(node, method_id)
        })
    }
}

impl FrameListener for MemoryCallGraphBuilder {
    fn listener_name(&self) -> &str {
        "memory-call-graph-builder"
    }

    fn on_alloc_stack_trace(&mut self, record: &AllocStackTrace) -> Result<(), ListenerError> {
        self.record_alloc(record);
        Ok(())
    }

    fn on_liveness_stack_trace(&mut self, record: &LivenessStackTrace) -> Result<(), ListenerError> {
        self.record_liveness(record);
        Ok(())
    }

    fn on_gc_happened(&mut self, record: GcHappened) -> Result<(), ListenerError> {
        self.record_gc(record);
        Ok(())
    }

    fn on_reset(&mut self) -> Result<(), ListenerError> {
        self.reset();
        Ok(())
    }
}

pub(crate) fn placeholder_name(class_id: ClassId) -> SharedStr {
    SharedStr::from(format!("<class {class_id}>"))
}

fn size_as_i64(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}
