//! Compact calling-context tree maintained while the target runs.
//!
//! Nodes live in a single arena and refer to each other by [`NodeId`]. A
//! node stores only its method id, its children and, when allocations end
//! on its path, terminal counters. Terminal nodes can sit at any depth.

use memcct_protocol::{Epoch, MethodId};
use serde::{Deserialize, Serialize};

/// Method id carried by per-class root nodes.
pub const ROOT_METHOD_ID: MethodId = MethodId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Children of a node. Most nodes have at most one child, so the single
/// case is kept inline and a list is only allocated on the second child.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildSet {
    #[default]
    Empty,
    One(NodeId),
    Many(Vec<NodeId>),
}

impl ChildSet {
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ChildSet::Empty)
    }

    /// Children in attachment order.
    pub fn as_slice(&self) -> &[NodeId] {
        match self {
            ChildSet::Empty => &[],
            ChildSet::One(id) => std::slice::from_ref(id),
            ChildSet::Many(ids) => ids,
        }
    }

    pub fn push(&mut self, id: NodeId) {
        match std::mem::take(self) {
            ChildSet::Empty => *self = ChildSet::One(id),
            ChildSet::One(first) => *self = ChildSet::Many(vec![first, id]),
            ChildSet::Many(mut ids) => {
                ids.reserve_exact(1);
                ids.push(id);
                *self = ChildSet::Many(ids);
            }
        }
    }
}

/// Allocation counters of a terminal node. They cover objects allocated
/// exactly at this path, never those of descendants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocCounters {
    pub n_calls: i64,
    pub total_obj_size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochCount {
    pub epoch: Epoch,
    pub live: u32,
}

/// Live-object counts per birth epoch, kept in first-insertion order.
///
/// No two rows share an epoch; a row whose count drops to zero is removed
/// and the rows after it shift left without reordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEpochs(Vec<EpochCount>);

impl LiveEpochs {
    pub fn add(&mut self, epoch: Epoch) {
        if let Some(row) = self.0.iter_mut().find(|row| row.epoch == epoch) {
            row.live += 1;
            return;
        }
        self.0.reserve_exact(1);
        self.0.push(EpochCount { epoch, live: 1 });
    }

    /// Returns false when no live object of `epoch` is recorded.
    pub fn remove(&mut self, epoch: Epoch) -> bool {
        let Some(pos) = self.0.iter().position(|row| row.epoch == epoch) else {
            return false;
        };
        self.0[pos].live -= 1;
        if self.0[pos].live == 0 {
            self.0.remove(pos);
        }
        true
    }

    pub fn total_live(&self) -> u64 {
        self.0.iter().map(|row| u64::from(row.live)).sum()
    }

    pub fn rows(&self) -> &[EpochCount] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    #[default]
    Internal,
    AllocTerminal(AllocCounters),
    LivenessTerminal {
        counters: AllocCounters,
        epochs: LiveEpochs,
    },
}

impl NodeKind {
    pub fn counters(&self) -> Option<AllocCounters> {
        match self {
            NodeKind::Internal => None,
            NodeKind::AllocTerminal(c) | NodeKind::LivenessTerminal { counters: c, .. } => {
                Some(*c)
            }
        }
    }

    pub fn epochs(&self) -> Option<&LiveEpochs> {
        match self {
            NodeKind::LivenessTerminal { epochs, .. } => Some(epochs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeNode {
    pub method_id: MethodId,
    pub children: ChildSet,
    pub kind: NodeKind,
}

impl RuntimeNode {
    fn new(method_id: MethodId) -> Self {
        Self {
            method_id,
            children: ChildSet::Empty,
            kind: NodeKind::Internal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, NodeKind::Internal)
    }

    /// Live objects on this exact path. Zero for non-liveness nodes.
    pub fn total_live_objects(&self) -> u64 {
        self.kind.epochs().map_or(0, LiveEpochs::total_live)
    }
}

/// Arena holding every node of every class tree of one session.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RuntimeCct {
    nodes: Vec<RuntimeNode>,
}

impl RuntimeCct {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Add a parentless node.
    pub fn add_root(&mut self, method_id: MethodId) -> NodeId {
        self.push(RuntimeNode::new(method_id))
    }

    pub fn node(&self, id: NodeId) -> &RuntimeNode {
        &self.nodes[id.index()]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).children.as_slice()
    }

    pub fn find_child(&self, parent: NodeId, method_id: MethodId) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|&child| self.node(child).method_id == method_id)
    }

    /// Attach a new child unconditionally.
    pub fn add_child(&mut self, parent: NodeId, method_id: MethodId) -> NodeId {
        let child = self.push(RuntimeNode::new(method_id));
        self.nodes[parent.index()].children.push(child);
        child
    }

    pub fn child_or_insert(&mut self, parent: NodeId, method_id: MethodId) -> NodeId {
        match self.find_child(parent, method_id) {
            Some(child) => child,
            None => self.add_child(parent, method_id),
        }
    }

    /// Count one more object of `size` bytes allocated at `id`.
    pub fn record_allocation(&mut self, id: NodeId, size: u64) {
        let node = &mut self.nodes[id.index()];
        if matches!(node.kind, NodeKind::Internal) {
            node.kind = NodeKind::AllocTerminal(AllocCounters::default());
        }
        if let NodeKind::AllocTerminal(counters) | NodeKind::LivenessTerminal { counters, .. } =
            &mut node.kind
        {
            counters.n_calls += 1;
            counters.total_obj_size += size_as_i64(size);
        }
    }

    /// Count a tracked object born in `epoch`. The node keeps its allocation
    /// counters if it was an allocation terminal before.
    pub fn add_live_object(&mut self, id: NodeId, epoch: Epoch, size: u64) {
        let node = &mut self.nodes[id.index()];
        if !matches!(node.kind, NodeKind::LivenessTerminal { .. }) {
            let counters = node.kind.counters().unwrap_or_default();
            node.kind = NodeKind::LivenessTerminal {
                counters,
                epochs: LiveEpochs::default(),
            };
        }
        if let NodeKind::LivenessTerminal { counters, epochs } = &mut node.kind {
            counters.n_calls += 1;
            counters.total_obj_size += size_as_i64(size);
            epochs.add(epoch);
        }
    }

    /// Forget a collected object. Live bytes shrink, the allocation count
    /// stays. Returns false if the node had no live object of that epoch.
    pub fn remove_live_object(&mut self, id: NodeId, epoch: Epoch, size: u64) -> bool {
        match &mut self.nodes[id.index()].kind {
            NodeKind::LivenessTerminal { counters, epochs } => {
                if !epochs.remove(epoch) {
                    return false;
                }
                counters.total_obj_size -= size_as_i64(size);
                true
            }
            _ => false,
        }
    }

    /// Structural deep copy of the trees under `roots` into a fresh arena.
    ///
    /// Returns the new arena and the copied roots in the same order.
    /// Nodes not reachable from `roots` are left behind.
    pub fn deep_copy(&self, roots: &[NodeId]) -> (RuntimeCct, Vec<NodeId>) {
        let mut copy = RuntimeCct {
            nodes: Vec::with_capacity(self.nodes.len()),
        };
        let new_roots = roots.iter().map(|&root| self.copy_into(root, &mut copy)).collect();
        (copy, new_roots)
    }

    fn copy_into(&self, id: NodeId, dest: &mut RuntimeCct) -> NodeId {
        let src = self.node(id);
        let new_id = dest.push(RuntimeNode {
            method_id: src.method_id,
            children: ChildSet::Empty,
            kind: src.kind.clone(),
        });
        let children = match &src.children {
            ChildSet::Empty => ChildSet::Empty,
            ChildSet::One(child) => ChildSet::One(self.copy_into(*child, dest)),
            ChildSet::Many(kids) => {
                ChildSet::Many(kids.iter().map(|&kid| self.copy_into(kid, dest)).collect())
            }
        };
        dest.nodes[new_id.index()].children = children;
        new_id
    }

    fn push(&mut self, node: RuntimeNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }
}

fn size_as_i64(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn m(id: u32) -> MethodId {
        MethodId(id)
    }

    #[test]
    fn children_switch_from_inline_to_list() {
        let mut cct = RuntimeCct::new();
        let root = cct.add_root(ROOT_METHOD_ID);
        let a = cct.add_child(root, m(1));
        assert!(matches!(cct.node(root).children, ChildSet::One(id) if id == a));
        let b = cct.add_child(root, m(2));
        assert!(matches!(&cct.node(root).children, ChildSet::Many(ids) if ids == &[a, b]));
    }

    #[test]
    fn child_or_insert_reuses_existing_path() {
        let mut cct = RuntimeCct::new();
        let root = cct.add_root(ROOT_METHOD_ID);
        let a = cct.child_or_insert(root, m(1));
        let again = cct.child_or_insert(root, m(1));
        assert_eq!(a, again);
        assert_eq!(cct.len(), 2);
    }

    #[test]
    fn terminal_in_the_middle_of_a_path() {
        let mut cct = RuntimeCct::new();
        let root = cct.add_root(ROOT_METHOD_ID);
        let a = cct.child_or_insert(root, m(1));
        let b = cct.child_or_insert(a, m(2));
        cct.record_allocation(a, 16);
        cct.record_allocation(b, 8);
        cct.record_allocation(b, 8);

        assert_eq!(
            cct.node(a).kind.counters(),
            Some(AllocCounters { n_calls: 1, total_obj_size: 16 })
        );
        assert_eq!(cct.children(a), &[b]);
        assert_eq!(
            cct.node(b).kind.counters(),
            Some(AllocCounters { n_calls: 2, total_obj_size: 16 })
        );
        assert!(!cct.node(root).is_terminal());
    }

    #[test]
    fn epoch_rows_compact_in_order() {
        let mut epochs = LiveEpochs::default();
        for epoch in [5, 7, 9, 7] {
            epochs.add(epoch);
        }
        assert_eq!(epochs.total_live(), 4);
        assert!(epochs.remove(5));
        let order: Vec<_> = epochs.rows().iter().map(|r| (r.epoch, r.live)).collect();
        assert_eq!(order, vec![(7, 2), (9, 1)]);
        assert!(!epochs.remove(5));
    }

    #[test]
    fn gc_shrinks_live_bytes_not_allocations() {
        let mut cct = RuntimeCct::new();
        let root = cct.add_root(ROOT_METHOD_ID);
        let leaf = cct.child_or_insert(root, m(3));
        cct.add_live_object(leaf, 1, 24);
        cct.add_live_object(leaf, 2, 24);
        assert!(cct.remove_live_object(leaf, 1, 24));
        assert!(!cct.remove_live_object(leaf, 1, 24));

        let node = cct.node(leaf);
        assert_eq!(node.total_live_objects(), 1);
        assert_eq!(
            node.kind.counters(),
            Some(AllocCounters { n_calls: 2, total_obj_size: 24 })
        );
    }

    #[test]
    fn deep_copy_is_independent() {
        let mut cct = RuntimeCct::new();
        let root = cct.add_root(ROOT_METHOD_ID);
        let a = cct.child_or_insert(root, m(1));
        let b = cct.child_or_insert(root, m(2));
        let c = cct.child_or_insert(b, m(3));
        cct.record_allocation(a, 4);
        cct.add_live_object(c, 0, 8);
        let _orphan = cct.add_root(m(99));

        let (mut copy, roots) = cct.deep_copy(&[root]);
        assert_eq!(copy.len(), 4);
        let copied_root = roots[0];
        assert_eq!(copy.children(copied_root).len(), 2);

        let copied_b = copy.children(copied_root)[1];
        let copied_c = copy.children(copied_b)[0];
        assert!(copy.remove_live_object(copied_c, 0, 8));
        assert_eq!(copy.node(copied_c).total_live_objects(), 0);
        assert_eq!(cct.node(c).total_live_objects(), 1);
    }

    proptest! {
        #[test]
        fn children_keep_attachment_order(n in 1usize..40) {
            let mut cct = RuntimeCct::new();
            let root = cct.add_root(ROOT_METHOD_ID);
            let mut attached = Vec::new();
            for k in 0..n {
                attached.push(cct.add_child(root, m(k as u32 + 1)));
                prop_assert_eq!(cct.node(root).children.len(), k + 1);
                prop_assert_eq!(cct.children(root), attached.as_slice());
            }
        }

        #[test]
        fn live_total_tracks_adds_minus_removes(
            ops in proptest::collection::vec((any::<bool>(), 0u32..6), 0..120)
        ) {
            let mut epochs = LiveEpochs::default();
            let mut model = std::collections::HashMap::<u32, u64>::new();
            for (add, epoch) in ops {
                if add {
                    epochs.add(epoch);
                    *model.entry(epoch).or_default() += 1;
                } else {
                    let expected = model.get(&epoch).copied().unwrap_or(0) > 0;
                    prop_assert_eq!(epochs.remove(epoch), expected);
                    if expected {
                        *model.entry(epoch).or_default() -= 1;
                    }
                }
                prop_assert_eq!(epochs.total_live(), model.values().sum::<u64>());
                let mut seen = std::collections::HashSet::new();
                for row in epochs.rows() {
                    prop_assert!(row.live > 0);
                    prop_assert!(seen.insert(row.epoch));
                }
            }
        }
    }
}
