//! Vocabulary shared between the memory instrumentation agent and the
//! analysis core: frame tags, id types and the decoded record shapes.

pub mod ids;
pub mod records;
pub mod shared_str;
pub mod tags;
pub mod writer;

pub use ids::{ClassId, Epoch, MethodId, ObjectId, ThreadId};
pub use records::{
    AllocStackTrace, GcHappened, LivenessStackTrace, MonitorEvent, NewMonitor, NewThread,
    ProfilingPointHit, TimeAdjust,
};
pub use shared_str::SharedStr;
pub use tags::FrameTag;
pub use writer::FrameWriter;
