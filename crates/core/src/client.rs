//! Inbound interface to the profiled JVM.

use memcct_protocol::{MethodId, SharedStr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::MethodNames;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("profiled application is not connected")]
    Disconnected,
    #[error("agent round-trip failed: {0}")]
    Communication(String),
}

/// One row of a sampled heap histogram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramEntry {
    pub class_name: SharedStr,
    pub instances: i64,
    pub bytes: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapHistogram {
    /// Wall-clock time the histogram was taken, in milliseconds.
    pub time_millis: u64,
    pub entries: Vec<HistogramEntry>,
}

/// Blocking round-trips to the agent.
///
/// Every call may block on the connection; callers must not hold locks that
/// the event-processing thread needs while waiting.
pub trait ProfilerClient: Send + Sync {
    /// Allocation counts for every instrumented class, indexed by class id.
    /// These count every allocation, not only the sampled ones that carry a
    /// stack trace.
    fn allocated_objects_count_results(&self) -> Result<Vec<i64>, ClientError>;

    fn heap_histogram(&self) -> Result<HeapHistogram, ClientError>;

    /// Resolve a batch of method ids. The result is positionally aligned
    /// with `ids`; a shorter result leaves the tail unresolved.
    fn method_names_for_ids(&self, ids: &[MethodId]) -> Result<Vec<MethodNames>, ClientError>;
}
