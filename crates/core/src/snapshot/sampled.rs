use memcct_protocol::SharedStr;
use serde::{Deserialize, Serialize};

use super::{ClassStats, SnapshotError};
use crate::client::{HeapHistogram, ProfilerClient};

/// Heap histogram taken by the agent. Per-class numbers only, no call
/// trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampledSnapshot {
    time_taken: u64,
    class_names: Vec<SharedStr>,
    instances: Vec<i64>,
    bytes: Vec<i64>,
}

impl SampledSnapshot {
    pub fn capture(client: &dyn ProfilerClient) -> Result<SampledSnapshot, SnapshotError> {
        Ok(Self::from_histogram(client.heap_histogram()?))
    }

    pub fn from_histogram(histogram: HeapHistogram) -> SampledSnapshot {
        let n = histogram.entries.len();
        let mut snapshot = SampledSnapshot {
            time_taken: histogram.time_millis,
            class_names: Vec::with_capacity(n),
            instances: Vec::with_capacity(n),
            bytes: Vec::with_capacity(n),
        };
        for entry in histogram.entries {
            snapshot.class_names.push(entry.class_name);
            snapshot.instances.push(entry.instances);
            snapshot.bytes.push(entry.bytes);
        }
        tracing::debug!(classes = n, "heap histogram snapshot taken");
        snapshot
    }

    pub fn time_taken(&self) -> u64 {
        self.time_taken
    }

    pub fn class_names(&self) -> &[SharedStr] {
        &self.class_names
    }

    pub fn instances(&self) -> &[i64] {
        &self.instances
    }

    pub fn bytes(&self) -> &[i64] {
        &self.bytes
    }

    pub fn class_stats(&self, class_id: usize) -> Option<ClassStats> {
        Some(ClassStats {
            objects: *self.instances.get(class_id)?,
            size: *self.bytes.get(class_id)?,
            ..ClassStats::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HistogramEntry;

    #[test]
    fn columns_follow_histogram_order() {
        let snap = SampledSnapshot::from_histogram(HeapHistogram {
            time_millis: 42,
            entries: vec![
                HistogramEntry {
                    class_name: "char[]".into(),
                    instances: 10,
                    bytes: 400,
                },
                HistogramEntry {
                    class_name: "java.util.HashMap$Node".into(),
                    instances: 3,
                    bytes: 96,
                },
            ],
        });
        assert_eq!(snap.time_taken(), 42);
        assert_eq!(snap.class_names()[1], "java.util.HashMap$Node");
        assert_eq!(snap.class_stats(0).unwrap().size, 400);
        assert!(snap.class_stats(2).is_none());
    }
}
