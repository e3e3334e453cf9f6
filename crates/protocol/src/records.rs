use serde::{Deserialize, Serialize};

use crate::{ClassId, MethodId, ObjectId, SharedStr, ThreadId};

/// A sampled allocation with the call path that produced it.
///
/// `method_ids` is in call-path order: the first id hangs directly below the
/// class root, the last one is the allocating frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStackTrace {
    pub class_id: ClassId,
    /// Object size in bytes (40-bit on the wire).
    pub object_size: u64,
    pub method_ids: Vec<MethodId>,
}

/// A tracked allocation whose lifetime is followed until it is collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessStackTrace {
    pub object_id: ObjectId,
    pub object_size: u64,
    pub method_ids: Vec<MethodId>,
}

impl LivenessStackTrace {
    pub fn class_id(&self) -> ClassId {
        self.object_id.class_id()
    }
}

/// A tracked object was reclaimed by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcHappened {
    pub object_id: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewThread {
    pub thread_id: ThreadId,
    pub name: SharedStr,
    pub class_name: SharedStr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMonitor {
    pub monitor_id: u32,
    pub class_name: SharedStr,
}

/// Monitor entry or exit, attributed to the thread selected by the most
/// recent thread-switch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub thread_id: Option<ThreadId>,
    pub monitor_id: u32,
    /// 56-bit timestamp.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilingPointHit {
    pub point_id: u16,
    pub thread_id: ThreadId,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAdjust {
    pub absolute_delta: u64,
    pub thread_cpu_delta: u64,
}
