//! Signed difference of two presentation trees.
//!
//! Every diff node pairs a node of the left tree with the node of the right
//! tree that has the same [`Handle`] at the same position. Either side may
//! be missing; a missing side counts as zero.

use std::borrow::Cow;
use std::collections::HashMap;

use memcct_protocol::SharedStr;

use crate::model::MethodIdTable;
use crate::views::preso::{Handle, PresoNode, PresoTree, SortKey};

/// Counters of one side of a diff node.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SideCounters {
    pub n_calls: i64,
    pub total_obj_size: i64,
    pub live_object_count: i64,
    pub avg_object_age: f32,
    pub surviving_generations: i32,
}

impl SideCounters {
    fn of(node: &PresoNode) -> Self {
        Self {
            n_calls: node.n_calls(),
            total_obj_size: node.total_obj_size(),
            live_object_count: node.live_object_count(),
            avg_object_age: node.avg_object_age(),
            surviving_generations: node.surviving_generations(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiffNode {
    handle: Handle,
    name: SharedStr,
    liveness: bool,
    left: Option<SideCounters>,
    right: Option<SideCounters>,
    children: Vec<DiffNode>,
}

impl DiffNode {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn name(&self) -> &SharedStr {
        &self.name
    }

    pub fn is_liveness(&self) -> bool {
        self.liveness
    }

    pub fn left(&self) -> Option<&SideCounters> {
        self.left.as_ref()
    }

    pub fn right(&self) -> Option<&SideCounters> {
        self.right.as_ref()
    }

    pub fn children(&self) -> &[DiffNode] {
        &self.children
    }

    pub fn n_children(&self) -> usize {
        self.children.len()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn n_calls(&self) -> i64 {
        self.delta(|s| s.n_calls)
    }

    pub fn total_obj_size(&self) -> i64 {
        self.delta(|s| s.total_obj_size)
    }

    pub fn live_object_count(&self) -> i64 {
        self.delta(|s| s.live_object_count)
    }

    pub fn surviving_generations(&self) -> i32 {
        self.delta(|s| s.surviving_generations)
    }

    pub fn avg_object_age(&self) -> f32 {
        self.delta(|s| s.avg_object_age)
    }

    fn delta<T>(&self, field: impl Fn(&SideCounters) -> T) -> T
    where
        T: Default + std::ops::Sub<Output = T>,
    {
        let left = self.left.as_ref().map(&field).unwrap_or_default();
        let right = self.right.as_ref().map(&field).unwrap_or_default();
        right - left
    }

    fn sort_recursive(&mut self, key: SortKey, ascending: bool) {
        let compare = |a: &DiffNode, b: &DiffNode| match key {
            SortKey::Name => a.name.cmp(&b.name),
            SortKey::TotalSize => a.total_obj_size().cmp(&b.total_obj_size()),
            SortKey::Calls => a.n_calls().cmp(&b.n_calls()),
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
            child.sort_recursive(key, ascending);
        }
    }
}

impl PartialEq for DiffNode {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for DiffNode {}

impl std::hash::Hash for DiffNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

#[derive(Debug, Clone)]
pub struct DiffTree {
    root: DiffNode,
}

impl DiffTree {
    /// Diff `left` (the older snapshot) against `right`. Returns `None`
    /// when neither side has a tree.
    pub fn build(left: Option<&PresoTree>, right: Option<&PresoTree>) -> Option<DiffTree> {
        let left = left.map(|t| Side {
            node: Cow::Borrowed(t.root()),
            methods: t.methods(),
        });
        let right = right.map(|t| Side {
            node: Cow::Borrowed(t.root()),
            methods: t.methods(),
        });
        if left.is_none() && right.is_none() {
            return None;
        }
        Some(DiffTree {
            root: diff_node(left, right),
        })
    }

    pub fn root(&self) -> &DiffNode {
        &self.root
    }

    pub fn sort_children(&mut self, key: SortKey, ascending: bool) {
        self.root.sort_recursive(key, ascending);
    }

    pub fn find_path(&self, names: &[&str]) -> Option<&DiffNode> {
        names.iter().try_fold(&self.root, |node, wanted| {
            node.children.iter().find(|child| child.name == *wanted)
        })
    }

    pub fn node_count(&self) -> usize {
        fn count(node: &DiffNode) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        count(&self.root)
    }
}

struct Side<'a> {
    node: Cow<'a, PresoNode>,
    methods: &'a MethodIdTable,
}

fn diff_node(left: Option<Side<'_>>, right: Option<Side<'_>>) -> DiffNode {
    let (handle, name, liveness) = match left.as_ref().or(right.as_ref()) {
        Some(side) => (
            side.node.handle(side.methods),
            side.node.name(side.methods),
            side.node.liveness().is_some(),
        ),
        None => (Handle::for_class(SharedStr::default()), SharedStr::default(), false),
    };

    let left_kids = left.as_ref().map(group_children).unwrap_or_default();
    let mut right_kids = right.as_ref().map(group_children).unwrap_or_default();

    let mut children = Vec::with_capacity(left_kids.len().max(right_kids.len()));
    let mut right_index: HashMap<Handle, usize> = right_kids
        .iter()
        .enumerate()
        .map(|(i, (h, _))| (h.clone(), i))
        .collect();
    let mut right_slots: Vec<Option<Side<'_>>> = right_kids.drain(..).map(|(_, s)| Some(s)).collect();

    for (handle, side) in left_kids {
        let partner = right_index
            .remove(&handle)
            .and_then(|i| right_slots[i].take());
        children.push(diff_node(Some(side), partner));
    }
    for side in right_slots.into_iter().flatten() {
        children.push(diff_node(None, Some(side)));
    }

    DiffNode {
        handle,
        name,
        liveness,
        left: left.as_ref().map(|s| SideCounters::of(&s.node)),
        right: right.as_ref().map(|s| SideCounters::of(&s.node)),
        children,
    }
}

/// Children of one side keyed by handle, same-handle siblings merged.
fn group_children<'a>(side: &Side<'a>) -> Vec<(Handle, Side<'a>)> {
    let methods = side.methods;
    let mut index: HashMap<Handle, usize> = HashMap::new();
    let mut groups: Vec<(Handle, Side<'a>)> = Vec::new();

    let mut push = |child: Cow<'a, PresoNode>| {
        let handle = child.handle(methods);
        match index.get(&handle) {
            Some(&i) => groups[i].1.node.to_mut().merge(child.into_owned(), methods),
            None => {
                index.insert(handle.clone(), groups.len());
                groups.push((handle, Side { node: child, methods }));
            }
        }
    };
    match &side.node {
        Cow::Borrowed(node) => node.children().iter().for_each(|c| push(Cow::Borrowed(c))),
        Cow::Owned(node) => node.children().iter().for_each(|c| push(Cow::Owned(c.clone()))),
    }
    groups
}
