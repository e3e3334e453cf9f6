pub mod diff;
pub mod preso;

pub use diff::{DiffNode, DiffTree, SideCounters};
pub use preso::{
    BuildOptions, Handle, LivenessStats, NodeFrame, PresoKind, PresoNode, PresoTree, SortKey,
};
