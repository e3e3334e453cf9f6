//! Scripted stand-in for the profiled JVM.

#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use memcct_core::client::{ClientError, HeapHistogram, ProfilerClient};
use memcct_core::model::MethodNames;
use memcct_protocol::{AllocStackTrace, ClassId, FrameWriter, LivenessStackTrace, MethodId, ObjectId};

#[derive(Default)]
pub struct FakeClient {
    pub counts: Mutex<Vec<i64>>,
    pub histogram: Mutex<HeapHistogram>,
    batches: AtomicUsize,
    ids_requested: AtomicUsize,
}

impl FakeClient {
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn ids_requested(&self) -> usize {
        self.ids_requested.load(Ordering::SeqCst)
    }
}

impl ProfilerClient for FakeClient {
    fn allocated_objects_count_results(&self) -> Result<Vec<i64>, ClientError> {
        Ok(self.counts.lock().map_err(|_| ClientError::Disconnected)?.clone())
    }

    fn heap_histogram(&self) -> Result<HeapHistogram, ClientError> {
        Ok(self.histogram.lock().map_err(|_| ClientError::Disconnected)?.clone())
    }

    fn method_names_for_ids(&self, ids: &[MethodId]) -> Result<Vec<MethodNames>, ClientError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.ids_requested.fetch_add(ids.len(), Ordering::SeqCst);
        Ok(ids.iter().map(|id| method(id.0)).collect())
    }
}

pub fn method(id: u32) -> MethodNames {
    MethodNames::new("app.Service", format!("m{id}"), "()V")
}

/// Display name of the method the fake client reports for `id`.
pub fn name(id: u32) -> String {
    method(id).display_name()
}

pub fn alloc(w: &mut FrameWriter, class: u16, size: u64, path: &[u32]) {
    w.alloc_stack_trace(&AllocStackTrace {
        class_id: ClassId(class),
        object_size: size,
        method_ids: path.iter().map(|&m| MethodId(m)).collect(),
    });
}

pub fn live(w: &mut FrameWriter, object_id: ObjectId, size: u64, path: &[u32]) {
    w.liveness_stack_trace(&LivenessStackTrace {
        object_id,
        object_size: size,
        method_ids: path.iter().map(|&m| MethodId(m)).collect(),
    });
}
