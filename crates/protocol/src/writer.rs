use crate::{
    AllocStackTrace, FrameTag, GcHappened, LivenessStackTrace, MethodId, NewMonitor, NewThread,
    ProfilingPointHit, ThreadId, TimeAdjust,
};

/// Encodes records in the agent's buffer layout (big-endian, packed widths).
///
/// Used by replay tooling and tests to produce byte streams the decoder
/// accepts.
#[derive(Debug, Default, Clone)]
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn alloc_stack_trace(&mut self, record: &AllocStackTrace) -> &mut Self {
        self.tag(FrameTag::ObjAllocStackTrace);
        self.u16(record.class_id.0);
        self.uint(record.object_size, 5);
        self.stack(&record.method_ids);
        self
    }

    pub fn liveness_stack_trace(&mut self, record: &LivenessStackTrace) -> &mut Self {
        self.tag(FrameTag::ObjLivenessStackTrace);
        self.uint(record.object_id.0, 8);
        self.uint(record.object_size, 5);
        self.stack(&record.method_ids);
        self
    }

    pub fn gc_happened(&mut self, record: GcHappened) -> &mut Self {
        self.tag(FrameTag::ObjGcHappened);
        self.uint(record.object_id.0, 8);
        self
    }

    pub fn reset_collectors(&mut self) -> &mut Self {
        self.tag(FrameTag::ResetCollectors);
        self
    }

    pub fn new_thread(&mut self, record: &NewThread) -> &mut Self {
        self.tag(FrameTag::NewThread);
        self.u16(record.thread_id.0);
        self.string(&record.name);
        self.string(&record.class_name);
        self
    }

    pub fn set_thread(&mut self, thread_id: ThreadId) -> &mut Self {
        self.tag(FrameTag::SetFollowingEventsThread);
        self.u16(thread_id.0);
        self
    }

    pub fn new_monitor(&mut self, record: &NewMonitor) -> &mut Self {
        self.tag(FrameTag::NewMonitor);
        self.uint(u64::from(record.monitor_id), 4);
        self.string(&record.class_name);
        self
    }

    pub fn monitor_entry(&mut self, monitor_id: u32, timestamp: u64) -> &mut Self {
        self.tag(FrameTag::MethodEntryMonitor);
        self.uint(u64::from(monitor_id), 4);
        self.uint(timestamp, 7);
        self
    }

    pub fn monitor_exit(&mut self, monitor_id: u32, timestamp: u64) -> &mut Self {
        self.tag(FrameTag::MethodExitMonitor);
        self.uint(u64::from(monitor_id), 4);
        self.uint(timestamp, 7);
        self
    }

    pub fn profiling_point_hit(&mut self, record: ProfilingPointHit) -> &mut Self {
        self.tag(FrameTag::ProfilingPointHit);
        self.u16(record.point_id);
        self.u16(record.thread_id.0);
        self.uint(record.timestamp, 7);
        self
    }

    pub fn adjust_time(&mut self, record: TimeAdjust) -> &mut Self {
        self.tag(FrameTag::AdjustTime);
        self.uint(record.absolute_delta, 7);
        self.uint(record.thread_cpu_delta, 7);
        self
    }

    /// Raw byte, for producing deliberately malformed streams.
    pub fn raw(&mut self, byte: u8) -> &mut Self {
        self.buf.push(byte);
        self
    }

    fn tag(&mut self, tag: FrameTag) {
        self.buf.push(tag.as_u8());
    }

    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Lowest `width` bytes of `value`, most significant first.
    fn uint(&mut self, value: u64, width: usize) {
        let bytes = value.to_be_bytes();
        self.buf.extend_from_slice(&bytes[8 - width..]);
    }

    fn stack(&mut self, method_ids: &[MethodId]) {
        self.uint(method_ids.len() as u64, 3);
        for id in method_ids {
            self.uint(u64::from(id.0), 4);
        }
    }

    fn string(&mut self, s: &str) {
        let len = u16::try_from(s.len()).unwrap_or(u16::MAX);
        self.u16(len);
        self.buf.extend_from_slice(&s.as_bytes()[..usize::from(len)]);
    }
}
