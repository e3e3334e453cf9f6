pub mod method_table;
pub mod runtime_cct;
pub mod surv_gen;

pub use method_table::{MethodIdTable, MethodNames};
pub use runtime_cct::{
    AllocCounters, ChildSet, EpochCount, LiveEpochs, NodeId, NodeKind, ROOT_METHOD_ID, RuntimeCct,
    RuntimeNode,
};
pub use surv_gen::SurvivingGenerationSet;
