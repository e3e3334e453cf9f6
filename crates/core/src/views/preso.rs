//! Display trees built on demand from a frozen run-time CCT.
//!
//! Counters in a presentation node are inclusive: a node reports what was
//! allocated on its own path plus everything below it. Siblings resolving
//! to the same class/method/signature are merged into one node.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use memcct_protocol::{Epoch, MethodId, SharedStr};
use serde::{Deserialize, Serialize};

use crate::builder::FrozenCallGraph;
use crate::model::{MethodIdTable, MethodNames, NodeId, RuntimeCct, RuntimeNode, SurvivingGenerationSet};

/// Structural identity of a node: the same triple in two trees means the
/// same call frame, whatever the method ids were.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub class_name: SharedStr,
    pub method_name: SharedStr,
    pub signature: SharedStr,
}

impl Handle {
    pub fn for_class(name: SharedStr) -> Self {
        Self {
            class_name: name,
            method_name: SharedStr::default(),
            signature: SharedStr::default(),
        }
    }
}

impl From<MethodNames> for Handle {
    fn from(names: MethodNames) -> Self {
        Self {
            class_name: names.class_name,
            method_name: names.method_name,
            signature: names.signature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeFrame {
    /// Tree root: the tracked class itself.
    Class(SharedStr),
    Method(MethodId),
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LivenessStats {
    pub live_object_count: i64,
    /// Tracked allocations of the whole class. Set on the root, -1 below.
    pub total_allocated_count: i64,
    pub avg_object_age: f32,
    pub surviving_generations: i32,
    age_sum: f64,
}

impl LivenessStats {
    fn below_root() -> Self {
        Self {
            total_allocated_count: -1,
            ..Self::default()
        }
    }

    fn update_average(&mut self) {
        self.avg_object_age = if self.live_object_count > 0 {
            (self.age_sum / self.live_object_count as f64) as f32
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PresoKind {
    Alloc,
    Liveness(LivenessStats),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Name,
    #[default]
    TotalSize,
    Calls,
    LiveObjects,
    AvgAge,
    Generations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub liveness: bool,
    /// Drop nodes with no live objects on their path and no children left.
    pub dont_show_zero_live_obj_alloc_paths: bool,
    /// Epoch that object ages are measured against.
    pub current_epoch: Epoch,
}

#[derive(Debug, Clone)]
pub struct PresoNode {
    frame: NodeFrame,
    name: OnceLock<SharedStr>,
    n_calls: i64,
    total_obj_size: i64,
    filtered: bool,
    kind: PresoKind,
    children: Vec<PresoNode>,
}

impl PresoNode {
    fn new(frame: NodeFrame, liveness: bool) -> Self {
        let name = match &frame {
            NodeFrame::Class(class_name) => OnceLock::from(class_name.clone()),
            _ => OnceLock::new(),
        };
        Self {
            frame,
            name,
            n_calls: 0,
            total_obj_size: 0,
            filtered: false,
            kind: if liveness {
                PresoKind::Liveness(LivenessStats::below_root())
            } else {
                PresoKind::Alloc
            },
            children: Vec::new(),
        }
    }

    pub fn frame(&self) -> &NodeFrame {
        &self.frame
    }

    pub fn kind(&self) -> &PresoKind {
        &self.kind
    }

    pub fn n_calls(&self) -> i64 {
        self.n_calls
    }

    pub fn total_obj_size(&self) -> i64 {
        self.total_obj_size
    }

    pub fn children(&self) -> &[PresoNode] {
        &self.children
    }

    pub fn n_children(&self) -> usize {
        self.children.len()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    pub fn liveness(&self) -> Option<&LivenessStats> {
        match &self.kind {
            PresoKind::Liveness(stats) => Some(stats),
            PresoKind::Alloc => None,
        }
    }

    pub fn live_object_count(&self) -> i64 {
        self.liveness().map_or(0, |s| s.live_object_count)
    }

    pub fn avg_object_age(&self) -> f32 {
        self.liveness().map_or(0.0, |s| s.avg_object_age)
    }

    pub fn surviving_generations(&self) -> i32 {
        self.liveness().map_or(0, |s| s.surviving_generations)
    }

    pub fn total_allocated_count(&self) -> i64 {
        self.liveness().map_or(-1, |s| s.total_allocated_count)
    }

    /// Display name, resolved through `methods` on first access.
    pub fn name(&self, methods: &MethodIdTable) -> SharedStr {
        self.name
            .get_or_init(|| match &self.frame {
                NodeFrame::Class(name) => name.clone(),
                NodeFrame::Method(id) => SharedStr::from(methods.names(*id).display_name()),
            })
            .clone()
    }

    pub fn handle(&self, methods: &MethodIdTable) -> Handle {
        match &self.frame {
            NodeFrame::Class(name) => Handle::for_class(name.clone()),
            NodeFrame::Method(id) => Handle::from(methods.names(*id)),
        }
    }

    /// Fold a same-handle sibling into this node.
    pub fn merge(&mut self, other: PresoNode, methods: &MethodIdTable) {
        self.n_calls += other.n_calls;
        self.total_obj_size += other.total_obj_size;
        self.filtered &= other.filtered;
        if let (PresoKind::Liveness(mine), PresoKind::Liveness(theirs)) = (&mut self.kind, &other.kind)
        {
            mine.live_object_count += theirs.live_object_count;
            mine.age_sum += theirs.age_sum;
            mine.surviving_generations = mine.surviving_generations.max(theirs.surviving_generations);
            mine.update_average();
        }
        let mut children = std::mem::take(&mut self.children);
        children.extend(other.children);
        self.children = merge_siblings(children, methods);
    }

    /// Add the counters a run-time terminal holds for its own path.
    fn add_own(&mut self, node: &RuntimeNode, current_epoch: Epoch, gens: &mut SurvivingGenerationSet) {
        if let Some(counters) = node.kind.counters() {
            self.n_calls += counters.n_calls;
            self.total_obj_size += counters.total_obj_size;
        }
        let (PresoKind::Liveness(stats), Some(epochs)) = (&mut self.kind, node.kind.epochs()) else {
            return;
        };
        for row in epochs.rows() {
            let age = current_epoch.saturating_sub(row.epoch);
            stats.live_object_count += i64::from(row.live);
            stats.age_sum += f64::from(row.live) * f64::from(age);
            gens.add_age(age);
        }
    }

    fn adopt_children(&mut self, children: Vec<PresoNode>, gens: &SurvivingGenerationSet) {
        for child in &children {
            self.n_calls += child.n_calls;
            self.total_obj_size += child.total_obj_size;
            if let (PresoKind::Liveness(mine), PresoKind::Liveness(theirs)) =
                (&mut self.kind, &child.kind)
            {
                mine.live_object_count += theirs.live_object_count;
                mine.age_sum += theirs.age_sum;
            }
        }
        self.children = children;
        if let PresoKind::Liveness(stats) = &mut self.kind {
            // Saturates at i32::MAX distinct ages.
            stats.surviving_generations = i32::try_from(gens.total_no_of_ages()).unwrap_or(i32::MAX);
            stats.update_average();
        }
    }

    fn sort_recursive(&mut self, key: SortKey, ascending: bool, methods: &MethodIdTable) {
        let compare = |a: &PresoNode, b: &PresoNode| match key {
            SortKey::Name => a.name(methods).cmp(&b.name(methods)),
            SortKey::TotalSize => a.total_obj_size.cmp(&b.total_obj_size),
            SortKey::Calls => a.n_calls.cmp(&b.n_calls),
            SortKey::LiveObjects => a.live_object_count().cmp(&b.live_object_count()),
            SortKey::AvgAge => a.avg_object_age().total_cmp(&b.avg_object_age()),
            SortKey::Generations => a.surviving_generations().cmp(&b.surviving_generations()),
        };
        if ascending {
            self.children.sort_by(compare);
        } else {
            self.children.sort_by(|a, b| compare(b, a));
        }
        for child in &mut self.children {
            child.sort_recursive(key, ascending, methods);
        }
    }

    fn filter_recursive(&mut self, matches: &dyn Fn(&str) -> bool, methods: &MethodIdTable) -> bool {
        let mut any_child = false;
        for child in &mut self.children {
            any_child |= child.filter_recursive(matches, methods);
        }
        let visible = any_child || matches(&self.name(methods));
        self.filtered = !visible;
        visible
    }
}

/// Presentation tree for one class, with the name table its nodes resolve
/// against.
#[derive(Debug, Clone)]
pub struct PresoTree {
    root: PresoNode,
    methods: Arc<MethodIdTable>,
}

impl PresoTree {
    /// Build the tree of `class_index` in `graph`. Returns `None` if the
    /// graph has no such class.
    pub fn build(
        graph: &FrozenCallGraph,
        class_index: usize,
        methods: Arc<MethodIdTable>,
        options: BuildOptions,
    ) -> Option<PresoTree> {
        let class_name = graph.class_names.get(class_index)?.clone();
        let roots = graph.roots.get(class_index)?;
        let builder = TreeBuilder {
            cct: &graph.cct,
            methods: &methods,
            options,
        };

        let mut gens = SurvivingGenerationSet::new();
        let mut root = PresoNode::new(NodeFrame::Class(class_name), options.liveness);
        let kids: Vec<NodeId> = roots
            .iter()
            .flat_map(|&r| graph.cct.children(r).iter().copied())
            .collect();
        let children = builder.build_children(&kids, &mut gens);
        for &r in roots {
            root.add_own(graph.cct.node(r), options.current_epoch, &mut gens);
        }
        root.adopt_children(children, &gens);
        if let PresoKind::Liveness(stats) = &mut root.kind {
            stats.total_allocated_count = graph.totals.get(class_index).map_or(0, |t| t.tracked_alloc);
        }

        Some(PresoTree { root, methods })
    }

    pub fn root(&self) -> &PresoNode {
        &self.root
    }

    pub fn methods(&self) -> &Arc<MethodIdTable> {
        &self.methods
    }

    pub fn node_name(&self, node: &PresoNode) -> SharedStr {
        node.name(&self.methods)
    }

    pub fn handle(&self, node: &PresoNode) -> Handle {
        node.handle(&self.methods)
    }

    pub fn is_liveness(&self) -> bool {
        matches!(self.root.kind, PresoKind::Liveness(_))
    }

    pub fn sort_children(&mut self, key: SortKey, ascending: bool) {
        self.root.sort_recursive(key, ascending, &self.methods);
    }

    /// Mark nodes whose name does not match and that have no matching
    /// descendant. Returns whether anything matched.
    pub fn filter(&mut self, matches: impl Fn(&str) -> bool) -> bool {
        self.root.filter_recursive(&matches, &self.methods)
    }

    /// Follow display names from the root's children downwards.
    pub fn find_path(&self, names: &[&str]) -> Option<&PresoNode> {
        names.iter().try_fold(&self.root, |node, wanted| {
            node.children
                .iter()
                .find(|child| child.name(&self.methods) == *wanted)
        })
    }

    pub fn node_count(&self) -> usize {
        fn count(node: &PresoNode) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        count(&self.root)
    }
}

struct TreeBuilder<'a> {
    cct: &'a RuntimeCct,
    methods: &'a MethodIdTable,
    options: BuildOptions,
}

impl TreeBuilder<'_> {
    /// Build sibling subtrees. A lone child shares the parent's generation
    /// set; several children each get their own and are merged upward.
    fn build_children(&self, kids: &[NodeId], gens: &mut SurvivingGenerationSet) -> Vec<PresoNode> {
        let built: Vec<PresoNode> = match kids {
            [] => Vec::new(),
            [only] => self.build_node(*only, gens).into_iter().collect(),
            _ => kids
                .iter()
                .filter_map(|&kid| {
                    let mut child_gens = SurvivingGenerationSet::new();
                    let node = self.build_node(kid, &mut child_gens);
                    gens.merge_with(&child_gens);
                    node
                })
                .collect(),
        };
        merge_siblings(built, self.methods)
    }

    fn build_node(&self, id: NodeId, gens: &mut SurvivingGenerationSet) -> Option<PresoNode> {
        let rt = self.cct.node(id);
        let children = self.build_children(rt.children.as_slice(), gens);

        let mut node = PresoNode::new(NodeFrame::Method(rt.method_id), self.options.liveness);
        node.add_own(rt, self.options.current_epoch, gens);
        if self.options.liveness
            && self.options.dont_show_zero_live_obj_alloc_paths
            && rt.total_live_objects() == 0
            && children.is_empty()
        {
            return None;
        }
        node.adopt_children(children, gens);
        Some(node)
    }
}

/// Merge same-handle siblings, keeping first-appearance order.
fn merge_siblings(nodes: Vec<PresoNode>, methods: &MethodIdTable) -> Vec<PresoNode> {
    if nodes.len() < 2 {
        return nodes;
    }
    let mut index: HashMap<Handle, usize> = HashMap::with_capacity(nodes.len());
    let mut merged: Vec<PresoNode> = Vec::with_capacity(nodes.len());
    for node in nodes {
        match index.get(&node.handle(methods)) {
            Some(&i) => merged[i].merge(node, methods),
            None => {
                index.insert(node.handle(methods), merged.len());
                merged.push(node);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MemoryCallGraphBuilder;
    use memcct_protocol::{AllocStackTrace, ClassId, LivenessStackTrace, ObjectId};

    fn table() -> Arc<MethodIdTable> {
        Arc::new(MethodIdTable::from_resolved(
            (1..=9).map(|id| (MethodId(id), MethodNames::new("p.C", format!("m{id}"), "()V"))),
        ))
    }

    fn alloc(b: &mut MemoryCallGraphBuilder, size: u64, path: &[u32]) {
        b.record_alloc(&AllocStackTrace {
            class_id: ClassId(0),
            object_size: size,
            method_ids: path.iter().map(|&m| MethodId(m)).collect(),
        });
    }

    fn live(b: &mut MemoryCallGraphBuilder, epoch: u16, seq: u32, path: &[u32]) -> ObjectId {
        let object_id = ObjectId::pack(ClassId(0), epoch, seq);
        b.record_liveness(&LivenessStackTrace {
            object_id,
            object_size: 16,
            method_ids: path.iter().map(|&m| MethodId(m)).collect(),
        });
        object_id
    }

    fn options(liveness: bool, prune: bool, epoch: Epoch) -> BuildOptions {
        BuildOptions {
            liveness,
            dont_show_zero_live_obj_alloc_paths: prune,
            current_epoch: epoch,
        }
    }

    #[test]
    fn alloc_counters_are_inclusive() {
        let methods = table();
        let mut b = MemoryCallGraphBuilder::new(methods.clone());
        b.define_class(ClassId(0), "java.lang.String");
        alloc(&mut b, 10, &[1, 2]);
        alloc(&mut b, 20, &[1, 3]);
        alloc(&mut b, 5, &[1]);
        let (graph, _) = b.freeze();

        let tree = PresoTree::build(&graph, 0, methods, options(false, false, 0)).unwrap();
        let root = tree.root();
        assert_eq!(tree.node_name(root), "java.lang.String");
        assert_eq!(root.n_calls(), 3);
        assert_eq!(root.total_obj_size(), 35);
        let m1 = tree.find_path(&["p.C.m1()V"]).unwrap();
        assert_eq!(m1.n_children(), 2);
        assert_eq!(m1.total_obj_size(), 35);
        let m3 = tree.find_path(&["p.C.m1()V", "p.C.m3()V"]).unwrap();
        assert!(m3.is_leaf());
        assert_eq!(m3.total_obj_size(), 20);
    }

    #[test]
    fn class_root_name_needs_no_lookup() {
        let root = PresoNode::new(NodeFrame::Class(SharedStr::from("byte[]")), false);
        assert_eq!(root.name.get().map(|n| &**n), Some("byte[]"));
        let frame = PresoNode::new(NodeFrame::Method(MethodId(1)), false);
        assert!(frame.name.get().is_none());
    }

    #[test]
    fn same_named_siblings_merge() {
        let methods = Arc::new(MethodIdTable::from_resolved([
            (MethodId(1), MethodNames::new("p.C", "run", "()V")),
            (MethodId(2), MethodNames::new("p.C", "run", "()V")),
            (MethodId(3), MethodNames::new("p.C", "leaf", "()V")),
        ]));
        let mut b = MemoryCallGraphBuilder::new(methods.clone());
        alloc(&mut b, 1, &[1, 3]);
        alloc(&mut b, 2, &[2, 3]);
        let (graph, _) = b.freeze();

        let tree = PresoTree::build(&graph, 0, methods, options(false, false, 0)).unwrap();
        assert_eq!(tree.root().n_children(), 1);
        let run = &tree.root().children()[0];
        assert_eq!(run.n_calls(), 2);
        assert_eq!(run.n_children(), 1);
        assert_eq!(run.children()[0].total_obj_size(), 3);
    }

    #[test]
    fn liveness_age_and_generations() {
        let methods = table();
        let mut b = MemoryCallGraphBuilder::new(methods.clone());
        live(&mut b, 1, 0, &[1, 2]);
        live(&mut b, 3, 1, &[1, 2]);
        live(&mut b, 3, 2, &[1, 4]);
        let gone = live(&mut b, 4, 3, &[1, 4]);
        b.record_gc(memcct_protocol::GcHappened { object_id: gone });
        let (graph, _) = b.freeze();
        assert_eq!(graph.current_epoch, 4);

        let tree = PresoTree::build(&graph, 0, methods, options(true, false, 5)).unwrap();
        let root = tree.root();
        assert_eq!(root.live_object_count(), 3);
        assert_eq!(root.total_allocated_count(), 4);
        // ages 4, 2, 2
        assert!((root.avg_object_age() - 8.0 / 3.0).abs() < 1e-6);
        assert_eq!(root.surviving_generations(), 2);

        let m2 = tree.find_path(&["p.C.m1()V", "p.C.m2()V"]).unwrap();
        assert_eq!(m2.surviving_generations(), 2);
        assert_eq!(m2.total_allocated_count(), -1);
        let m4 = tree.find_path(&["p.C.m1()V", "p.C.m4()V"]).unwrap();
        assert_eq!(m4.live_object_count(), 1);
        assert_eq!(m4.n_calls(), 2);
        assert_eq!(m4.surviving_generations(), 1);
    }

    #[test]
    fn no_live_objects_means_zero_age() {
        let methods = table();
        let mut b = MemoryCallGraphBuilder::new(methods.clone());
        let id = live(&mut b, 2, 0, &[1]);
        b.record_gc(memcct_protocol::GcHappened { object_id: id });
        let (graph, _) = b.freeze();
        let tree = PresoTree::build(&graph, 0, methods, options(true, false, 9)).unwrap();
        assert_eq!(tree.root().live_object_count(), 0);
        assert_eq!(tree.root().avg_object_age(), 0.0);
        assert_eq!(tree.root().n_children(), 1);
    }

    #[test]
    fn pruning_keeps_ancestors_of_live_nodes() {
        let methods = table();
        let mut b = MemoryCallGraphBuilder::new(methods.clone());
        live(&mut b, 0, 0, &[1, 2, 3]);
        let dead = live(&mut b, 0, 1, &[1, 4, 5]);
        b.record_gc(memcct_protocol::GcHappened { object_id: dead });
        let (graph, _) = b.freeze();

        let pruned = PresoTree::build(&graph, 0, methods.clone(), options(true, true, 1)).unwrap();
        let a = pruned.find_path(&["p.C.m1()V"]).unwrap();
        assert_eq!(a.n_children(), 1);
        assert!(pruned.find_path(&["p.C.m1()V", "p.C.m2()V", "p.C.m3()V"]).is_some());
        assert!(pruned.find_path(&["p.C.m1()V", "p.C.m4()V"]).is_none());

        let full = PresoTree::build(&graph, 0, methods, options(true, false, 1)).unwrap();
        assert!(full.find_path(&["p.C.m1()V", "p.C.m4()V", "p.C.m5()V"]).is_some());
    }

    #[test]
    fn sort_and_filter() {
        let methods = table();
        let mut b = MemoryCallGraphBuilder::new(methods.clone());
        alloc(&mut b, 5, &[1]);
        alloc(&mut b, 50, &[2]);
        alloc(&mut b, 20, &[3, 4]);
        let (graph, _) = b.freeze();
        let mut tree = PresoTree::build(&graph, 0, methods, options(false, false, 0)).unwrap();

        tree.sort_children(SortKey::TotalSize, false);
        let sizes: Vec<_> = tree.root().children().iter().map(PresoNode::total_obj_size).collect();
        assert_eq!(sizes, vec![50, 20, 5]);

        tree.sort_children(SortKey::Name, true);
        let first = &tree.root().children()[0];
        assert_eq!(tree.node_name(first), "p.C.m1()V");

        assert!(tree.filter(|name| name.contains("m4")));
        let kids = tree.root().children();
        assert!(kids[0].is_filtered());
        assert!(!kids[2].is_filtered());
        assert!(!kids[2].children()[0].is_filtered());
        assert!(!tree.root().is_filtered());
    }

    #[test]
    fn names_resolve_in_one_batch() {
        use crate::client::{ClientError, HeapHistogram, ProfilerClient};
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct Client(AtomicUsize);
        impl ProfilerClient for Client {
            fn allocated_objects_count_results(&self) -> Result<Vec<i64>, ClientError> {
                Ok(Vec::new())
            }
            fn heap_histogram(&self) -> Result<HeapHistogram, ClientError> {
                Ok(HeapHistogram::default())
            }
            fn method_names_for_ids(&self, ids: &[MethodId]) -> Result<Vec<MethodNames>, ClientError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(ids.iter().map(|id| MethodNames::new("q.D", format!("f{}", id.0), "()V")).collect())
            }
        }

        let client = Arc::new(Client::default());
        let methods = Arc::new(MethodIdTable::new(client.clone()));
        let mut b = MemoryCallGraphBuilder::new(methods.clone());
        alloc(&mut b, 1, &[1, 2, 3]);
        alloc(&mut b, 1, &[1, 4]);
        let (graph, _) = b.freeze();
        let tree = PresoTree::build(&graph, 0, methods, options(false, false, 0)).unwrap();
        assert!(tree.find_path(&["q.D.f1()V", "q.D.f2()V", "q.D.f3()V"]).is_some());
        assert!(tree.find_path(&["q.D.f1()V", "q.D.f4()V"]).is_some());
        assert_eq!(client.0.load(Ordering::SeqCst), 1);
    }
}
