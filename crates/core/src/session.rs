//! One profiled process: the decoder and builder that consume its frames,
//! and the snapshots taken from them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use memcct_protocol::ClassId;

use crate::builder::MemoryCallGraphBuilder;
use crate::client::ProfilerClient;
use crate::history::ClassHistoryDataManager;
use crate::model::MethodIdTable;
use crate::parsers::{FrameDecoder, FrameError, FrameListener};
use crate::settings::{MemorySettings, ProfilingMode};
use crate::snapshot::{
    AllocSnapshot, LivenessSnapshot, MemorySnapshot, SampledSnapshot, SnapshotError,
};

struct SessionState {
    decoder: FrameDecoder,
    builder: MemoryCallGraphBuilder,
}

/// Single-writer, readers-after-freeze wrapper around the call-graph
/// builder.
///
/// Buffers are applied under the session lock in arrival order. Taking a
/// snapshot deep-copies the trees under the same lock, so no snapshot ever
/// sees a half-applied buffer. Agent round-trips run after the lock is
/// released.
///
/// After every buffer the per-class totals are sampled into the class
/// history, if a class is tracked.
pub struct ProfilingSession {
    state: Mutex<SessionState>,
    client: Arc<dyn ProfilerClient>,
    history: Arc<ClassHistoryDataManager>,
    settings: MemorySettings,
}

impl ProfilingSession {
    pub fn new(client: Arc<dyn ProfilerClient>, settings: MemorySettings) -> Self {
        let methods = Arc::new(MethodIdTable::new(client.clone()));
        Self {
            state: Mutex::new(SessionState {
                decoder: FrameDecoder::new(),
                builder: MemoryCallGraphBuilder::new(methods),
            }),
            client,
            history: Arc::new(ClassHistoryDataManager::new(settings.history_buffer_size)),
            settings,
        }
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    pub fn methods(&self) -> Arc<MethodIdTable> {
        self.lock().builder.methods().clone()
    }

    pub fn define_class(&self, class_id: ClassId, name: &str) {
        self.lock().builder.define_class(class_id, name);
    }

    pub fn history(&self) -> &Arc<ClassHistoryDataManager> {
        &self.history
    }

    /// Start recording a history for `class_id`, replacing any earlier one.
    pub fn track_class_history(&self, class_id: ClassId) {
        let name = self.lock().builder.class_name(class_id);
        self.history.setup_class(class_id.index(), name);
    }

    pub fn stop_class_history(&self) {
        self.history.reset_class();
    }

    /// Decode one instrumentation buffer into the trees. On a malformed
    /// frame the records before it stay applied and the rest is dropped.
    pub fn process_buffer(&self, buf: &[u8]) -> Result<usize, FrameError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut listeners: [&mut dyn FrameListener; 1] = [&mut state.builder];
        let decoded = state.decoder.decode(buf, &mut listeners);
        let sample = self.history.is_tracking_class().then(|| self.history_sample(&state.builder));
        drop(guard);

        if let Some((counts, sizes)) = sample {
            match self.settings.mode {
                ProfilingMode::Allocations => self.history.process_data(&counts, &sizes),
                ProfilingMode::Liveness => self.history.process_liveness_data(&counts, &sizes),
            };
        }
        decoded
    }

    pub fn reset(&self) {
        self.lock().builder.reset();
    }

    /// Snapshot of the kind the session is configured for.
    pub fn take_snapshot(&self) -> Result<MemorySnapshot, SnapshotError> {
        match self.settings.mode {
            ProfilingMode::Allocations => self.take_alloc_snapshot().map(MemorySnapshot::Allocations),
            ProfilingMode::Liveness => self.take_liveness_snapshot().map(MemorySnapshot::Liveness),
        }
    }

    pub fn take_alloc_snapshot(&self) -> Result<AllocSnapshot, SnapshotError> {
        let (graph, merged_index, methods) = {
            let state = self.lock();
            let (graph, merged_index) = state.builder.freeze();
            (graph, merged_index, state.builder.methods().clone())
        };
        let counts = self.client.allocated_objects_count_results()?;
        Ok(AllocSnapshot::from_frozen(graph, &merged_index, &counts, methods))
    }

    pub fn take_liveness_snapshot(&self) -> Result<LivenessSnapshot, SnapshotError> {
        let (graph, merged_index, methods) = {
            let state = self.lock();
            let (graph, merged_index) = state.builder.freeze();
            (graph, merged_index, state.builder.methods().clone())
        };
        let counts = self.client.allocated_objects_count_results()?;
        Ok(LivenessSnapshot::from_frozen(
            graph,
            &merged_index,
            &counts,
            methods,
            self.settings.dont_show_zero_live_obj_alloc_paths,
        ))
    }

    pub fn take_heap_histogram(&self) -> Result<SampledSnapshot, SnapshotError> {
        SampledSnapshot::capture(self.client.as_ref())
    }

    /// Per-class object counts and sizes, indexed by class id.
    fn history_sample(&self, builder: &MemoryCallGraphBuilder) -> (Vec<i64>, Vec<i64>) {
        (0..builder.n_classes())
            .filter_map(|index| u16::try_from(index).ok())
            .map(|index| {
                let totals = builder.totals(ClassId(index));
                match self.settings.mode {
                    ProfilingMode::Allocations => (totals.sampled_allocs, totals.alloc_size),
                    ProfilingMode::Liveness => (totals.tracked_live, totals.tracked_live_size),
                }
            })
            .unzip()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ProfilingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfilingSession")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, HeapHistogram};
    use crate::model::MethodNames;
    use memcct_protocol::{AllocStackTrace, FrameWriter, GcHappened, LivenessStackTrace, MethodId, ObjectId};

    fn alloc(path: &[u32]) -> AllocStackTrace {
        AllocStackTrace {
            class_id: ClassId(0),
            object_size: 16,
            method_ids: path.iter().map(|&m| MethodId(m)).collect(),
        }
    }

    fn live(object_id: ObjectId) -> LivenessStackTrace {
        LivenessStackTrace {
            object_id,
            object_size: 8,
            method_ids: vec![MethodId(1)],
        }
    }

    struct Agent;

    impl ProfilerClient for Agent {
        fn allocated_objects_count_results(&self) -> Result<Vec<i64>, ClientError> {
            Ok(vec![3])
        }

        fn heap_histogram(&self) -> Result<HeapHistogram, ClientError> {
            Ok(HeapHistogram::default())
        }

        fn method_names_for_ids(&self, ids: &[MethodId]) -> Result<Vec<MethodNames>, ClientError> {
            Ok(ids
                .iter()
                .map(|id| MethodNames::new("app.Main", format!("m{}", id.0), "()V"))
                .collect())
        }
    }

    #[test]
    fn snapshot_is_isolated_from_later_buffers() {
        let session = ProfilingSession::new(Arc::new(Agent), MemorySettings::default());
        session.define_class(ClassId(0), "Obj");

        let mut w = FrameWriter::new();
        w.alloc_stack_trace(&alloc(&[1, 2]));
        assert_eq!(session.process_buffer(w.as_bytes()).unwrap(), 1);

        let snap = session.take_snapshot().unwrap();
        session.process_buffer(w.as_bytes()).unwrap();

        let tree = snap.create_presentation_cct(0).unwrap();
        assert_eq!(tree.root().n_calls(), 1);
        assert!(tree.find_path(&["app.Main.m1()V", "app.Main.m2()V"]).is_some());
        assert_eq!(session.take_alloc_snapshot().unwrap().graph().totals[0].sampled_allocs, 2);
    }

    #[test]
    fn liveness_mode_tracks_gc() {
        let settings = MemorySettings {
            mode: ProfilingMode::Liveness,
            ..MemorySettings::default()
        };
        let session = ProfilingSession::new(Arc::new(Agent), settings);
        let first = ObjectId::pack(ClassId(0), 1, 0);
        let mut w = FrameWriter::new();
        w.liveness_stack_trace(&live(first))
            .liveness_stack_trace(&live(ObjectId::pack(ClassId(0), 2, 1)))
            .gc_happened(GcHappened { object_id: first });
        assert_eq!(session.process_buffer(w.as_bytes()).unwrap(), 3);

        let MemorySnapshot::Liveness(snap) = session.take_snapshot().unwrap() else {
            panic!("expected a liveness snapshot");
        };
        let stats = snap.class_stats(0).unwrap();
        assert_eq!((stats.live_objects, stats.size), (1, 8));
        assert_eq!(snap.class_names()[0], "<class #0>");
    }

    #[test]
    fn tracked_class_is_sampled_per_buffer() {
        let settings = MemorySettings {
            history_buffer_size: 2,
            ..MemorySettings::default()
        };
        let session = ProfilingSession::new(Arc::new(Agent), settings);
        session.define_class(ClassId(0), "Obj");
        assert_eq!(session.history().capacity(), 2);

        let mut w = FrameWriter::new();
        w.alloc_stack_trace(&alloc(&[1]));
        session.process_buffer(w.as_bytes()).unwrap();
        assert_eq!(session.history().n_items(), 0);

        session.track_class_history(ClassId(0));
        assert_eq!(session.history().tracked_class_name().as_deref(), Some("Obj"));
        for _ in 0..3 {
            session.process_buffer(w.as_bytes()).unwrap();
        }
        let history = session.history();
        assert_eq!(history.n_items(), 3);
        assert_eq!(history.capacity(), 4);
        assert_eq!(history.alloc_counts(), vec![2, 3, 4]);
        assert_eq!(history.alloc_bytes(), vec![32, 48, 64]);

        session.stop_class_history();
        session.process_buffer(w.as_bytes()).unwrap();
        assert_eq!(session.history().n_items(), 0);
    }

    #[test]
    fn liveness_history_follows_gc() {
        let settings = MemorySettings {
            mode: ProfilingMode::Liveness,
            ..MemorySettings::default()
        };
        let session = ProfilingSession::new(Arc::new(Agent), settings);
        session.define_class(ClassId(0), "Obj");
        session.track_class_history(ClassId(0));

        let first = ObjectId::pack(ClassId(0), 1, 0);
        let mut w = FrameWriter::new();
        w.liveness_stack_trace(&live(first))
            .liveness_stack_trace(&live(ObjectId::pack(ClassId(0), 1, 1)));
        session.process_buffer(w.as_bytes()).unwrap();
        let mut gc = FrameWriter::new();
        gc.gc_happened(GcHappened { object_id: first });
        session.process_buffer(gc.as_bytes()).unwrap();

        assert_eq!(session.history().live_counts(), vec![2, 1]);
        assert_eq!(session.history().live_bytes(), vec![16, 8]);
    }

    #[test]
    fn malformed_buffer_keeps_earlier_records() {
        let session = ProfilingSession::new(Arc::new(Agent), MemorySettings::default());
        let mut w = FrameWriter::new();
        w.alloc_stack_trace(&alloc(&[1])).raw(0xEE);
        assert!(session.process_buffer(w.as_bytes()).is_err());
        let snap = session.take_alloc_snapshot().unwrap();
        assert_eq!(snap.graph().totals[0].sampled_allocs, 1);
    }
}
