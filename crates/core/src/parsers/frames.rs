//! Decoder for the agent's instrumentation event buffer.
//!
//! A buffer is a plain sequence of records, each a one-byte [`FrameTag`]
//! followed by a fixed or length-prefixed payload, big-endian. There is no
//! framing beyond the tag, so an unknown tag or a short payload ends the
//! buffer: the decoder cannot find the next record boundary.

use memcct_protocol::{
    AllocStackTrace, ClassId, FrameTag, GcHappened, LivenessStackTrace, MethodId, MonitorEvent,
    NewMonitor, NewThread, ObjectId, ProfilingPointHit, SharedStr, ThreadId, TimeAdjust,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed stream: unknown tag {tag} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },
    #[error("malformed stream: {tag} record at offset {offset} is truncated ({needed} more bytes needed)")]
    Truncated {
        tag: FrameTag,
        offset: usize,
        needed: usize,
    },
    #[error("malformed stream: {tag} record at offset {offset} holds invalid UTF-8")]
    Utf8 { tag: FrameTag, offset: usize },
}

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives decoded records in stream order. Every callback has a no-op
/// default so listeners only implement what they consume.
pub trait FrameListener {
    fn listener_name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_alloc_stack_trace(&mut self, _record: &AllocStackTrace) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_liveness_stack_trace(
        &mut self,
        _record: &LivenessStackTrace,
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_gc_happened(&mut self, _record: GcHappened) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_reset(&mut self) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_new_thread(&mut self, _record: &NewThread) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_new_monitor(&mut self, _record: &NewMonitor) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_monitor_entry(&mut self, _record: MonitorEvent) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_monitor_exit(&mut self, _record: MonitorEvent) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_profiling_point_hit(&mut self, _record: ProfilingPointHit) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_time_adjust(&mut self, _record: TimeAdjust) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Sequential decoder. The only state carried between records (and across
/// buffers) is the thread selected by the last thread-switch record.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    current_thread: Option<ThreadId>,
    records_decoded: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current_thread
    }

    pub fn records_decoded(&self) -> u64 {
        self.records_decoded
    }

    /// Decode `buf` and dispatch every record to every listener, in order.
    ///
    /// A listener error is logged and does not stop the others or the rest
    /// of the buffer. A malformed record stops decoding; records before it
    /// have already been dispatched. Returns the number of records handled.
    pub fn decode(
        &mut self,
        buf: &[u8],
        listeners: &mut [&mut dyn FrameListener],
    ) -> Result<usize, FrameError> {
        let mut reader = Reader { buf, pos: 0 };
        let mut count = 0;

        while reader.pos < buf.len() {
            let offset = reader.pos;
            let raw = reader.buf[offset];
            reader.pos += 1;
            let Ok(tag) = FrameTag::try_from(raw) else {
                let err = FrameError::UnknownTag { tag: raw, offset };
                tracing::error!(error = %err, decoded = count, "dropping rest of event buffer");
                return Err(err);
            };

            let mut rec = RecordReader {
                reader: &mut reader,
                tag,
                offset,
            };
            let event = match self.read_event(&mut rec) {
                Ok(event) => event,
                Err(err) => {
                    tracing::error!(error = %err, decoded = count, "dropping rest of event buffer");
                    return Err(err);
                }
            };
            if let Some(event) = event {
                dispatch(listeners, tag, &event);
            }
            count += 1;
            self.records_decoded += 1;
        }

        tracing::debug!(records = count, bytes = buf.len(), "decoded event buffer");
        Ok(count)
    }

    fn read_event(&mut self, rec: &mut RecordReader<'_, '_>) -> Result<Option<Event>, FrameError> {
        let event = match rec.tag {
            FrameTag::ObjAllocStackTrace => {
                let class_id = ClassId(rec.u16()?);
                let object_size = rec.uint(5)?;
                let method_ids = rec.stack()?;
                Event::Alloc(AllocStackTrace {
                    class_id,
                    object_size,
                    method_ids,
                })
            }
            FrameTag::ObjLivenessStackTrace => {
                let object_id = ObjectId(rec.uint(8)?);
                let object_size = rec.uint(5)?;
                let method_ids = rec.stack()?;
                Event::Liveness(LivenessStackTrace {
                    object_id,
                    object_size,
                    method_ids,
                })
            }
            FrameTag::ObjGcHappened => Event::Gc(GcHappened {
                object_id: ObjectId(rec.uint(8)?),
            }),
            FrameTag::ResetCollectors => Event::Reset,
            FrameTag::NewThread => {
                let thread_id = ThreadId(rec.u16()?);
                let name = rec.string()?;
                let class_name = rec.string()?;
                Event::NewThread(NewThread {
                    thread_id,
                    name,
                    class_name,
                })
            }
            FrameTag::SetFollowingEventsThread => {
                self.current_thread = Some(ThreadId(rec.u16()?));
                return Ok(None);
            }
            FrameTag::NewMonitor => {
                let monitor_id = rec.uint(4)? as u32;
                let class_name = rec.string()?;
                Event::NewMonitor(NewMonitor {
                    monitor_id,
                    class_name,
                })
            }
            FrameTag::MethodEntryMonitor | FrameTag::MethodExitMonitor => {
                let monitor_id = rec.uint(4)? as u32;
                let timestamp = rec.uint(7)?;
                let event = MonitorEvent {
                    thread_id: self.current_thread,
                    monitor_id,
                    timestamp,
                };
                if rec.tag == FrameTag::MethodEntryMonitor {
                    Event::MonitorEntry(event)
                } else {
                    Event::MonitorExit(event)
                }
            }
            FrameTag::ProfilingPointHit => {
                let point_id = rec.u16()?;
                let thread_id = ThreadId(rec.u16()?);
                let timestamp = rec.uint(7)?;
                Event::ProfilingPoint(ProfilingPointHit {
                    point_id,
                    thread_id,
                    timestamp,
                })
            }
            FrameTag::AdjustTime => {
                let absolute_delta = rec.uint(7)?;
                let thread_cpu_delta = rec.uint(7)?;
                Event::TimeAdjust(TimeAdjust {
                    absolute_delta,
                    thread_cpu_delta,
                })
            }
        };
        Ok(Some(event))
    }
}

enum Event {
    Alloc(AllocStackTrace),
    Liveness(LivenessStackTrace),
    Gc(GcHappened),
    Reset,
    NewThread(NewThread),
    NewMonitor(NewMonitor),
    MonitorEntry(MonitorEvent),
    MonitorExit(MonitorEvent),
    ProfilingPoint(ProfilingPointHit),
    TimeAdjust(TimeAdjust),
}

fn dispatch(listeners: &mut [&mut dyn FrameListener], tag: FrameTag, event: &Event) {
    for listener in listeners.iter_mut() {
        let result = match event {
            Event::Alloc(r) => listener.on_alloc_stack_trace(r),
            Event::Liveness(r) => listener.on_liveness_stack_trace(r),
            Event::Gc(r) => listener.on_gc_happened(*r),
            Event::Reset => listener.on_reset(),
            Event::NewThread(r) => listener.on_new_thread(r),
            Event::NewMonitor(r) => listener.on_new_monitor(r),
            Event::MonitorEntry(r) => listener.on_monitor_entry(*r),
            Event::MonitorExit(r) => listener.on_monitor_exit(*r),
            Event::ProfilingPoint(r) => listener.on_profiling_point_hit(*r),
            Event::TimeAdjust(r) => listener.on_time_adjust(*r),
        };
        if let Err(err) = result {
            tracing::warn!(
                listener = listener.listener_name(),
                %tag,
                error = %err,
                "event listener failed"
            );
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

/// Payload reader for one record; errors carry the record's tag and offset.
struct RecordReader<'r, 'a> {
    reader: &'r mut Reader<'a>,
    tag: FrameTag,
    offset: usize,
}

impl RecordReader<'_, '_> {
    fn take(&mut self, n: usize) -> Result<&[u8], FrameError> {
        let Reader { buf, pos } = &mut *self.reader;
        let available = buf.len() - *pos;
        if available < n {
            return Err(FrameError::Truncated {
                tag: self.tag,
                offset: self.offset,
                needed: n - available,
            });
        }
        let bytes = &buf[*pos..*pos + n];
        *pos += n;
        Ok(bytes)
    }

    /// Unsigned big-endian integer of `width` bytes (at most 8).
    fn uint(&mut self, width: usize) -> Result<u64, FrameError> {
        Ok(self
            .take(width)?
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        Ok(self.uint(2)? as u16)
    }

    fn stack(&mut self) -> Result<Vec<MethodId>, FrameError> {
        let depth = self.uint(3)? as usize;
        let bytes = self.take(depth * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| MethodId(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
            .collect())
    }

    fn string(&mut self) -> Result<SharedStr, FrameError> {
        let len = usize::from(self.u16()?);
        let (tag, offset) = (self.tag, self.offset);
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(SharedStr::from)
            .map_err(|_| FrameError::Utf8 { tag, offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memcct_protocol::FrameWriter;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<String>,
    }

    impl FrameListener for Recorder {
        fn on_alloc_stack_trace(&mut self, r: &AllocStackTrace) -> Result<(), ListenerError> {
            self.seen
                .push(format!("alloc {} {} {:?}", r.class_id, r.object_size, r.method_ids));
            Ok(())
        }

        fn on_liveness_stack_trace(&mut self, r: &LivenessStackTrace) -> Result<(), ListenerError> {
            self.seen.push(format!("live {:?}", r.object_id));
            Ok(())
        }

        fn on_gc_happened(&mut self, r: GcHappened) -> Result<(), ListenerError> {
            self.seen.push(format!("gc {:?}", r.object_id));
            Ok(())
        }

        fn on_reset(&mut self) -> Result<(), ListenerError> {
            self.seen.push("reset".into());
            Ok(())
        }

        fn on_monitor_entry(&mut self, r: MonitorEvent) -> Result<(), ListenerError> {
            self.seen.push(format!("enter {:?} {}", r.thread_id, r.monitor_id));
            Ok(())
        }

        fn on_new_thread(&mut self, r: &NewThread) -> Result<(), ListenerError> {
            self.seen.push(format!("thread {} {}", r.thread_id.0, r.name));
            Ok(())
        }
    }

    struct Failing;

    impl FrameListener for Failing {
        fn on_alloc_stack_trace(&mut self, _r: &AllocStackTrace) -> Result<(), ListenerError> {
            Err("boom".into())
        }
    }

    fn alloc(class: u16, size: u64, stack: &[u32]) -> AllocStackTrace {
        AllocStackTrace {
            class_id: ClassId(class),
            object_size: size,
            method_ids: stack.iter().map(|&m| MethodId(m)).collect(),
        }
    }

    #[test]
    fn decodes_records_in_order() {
        let oid = ObjectId::pack(ClassId(2), 1, 7);
        let mut w = FrameWriter::new();
        w.alloc_stack_trace(&alloc(1, 1 << 33, &[10, 11]))
            .liveness_stack_trace(&LivenessStackTrace {
                object_id: oid,
                object_size: 16,
                method_ids: vec![MethodId(12)],
            })
            .gc_happened(GcHappened { object_id: oid })
            .reset_collectors();

        let mut rec = Recorder::default();
        let mut decoder = FrameDecoder::new();
        let n = decoder.decode(w.as_bytes(), &mut [&mut rec]).unwrap();
        assert_eq!(n, 4);
        assert_eq!(
            rec.seen,
            vec![
                "alloc #1 8589934592 [MethodId(10), MethodId(11)]".to_string(),
                format!("live {oid:?}"),
                format!("gc {oid:?}"),
                "reset".to_string(),
            ]
        );
    }

    #[test]
    fn thread_switch_applies_to_following_monitor_events() {
        let mut w = FrameWriter::new();
        w.monitor_entry(1, 100)
            .set_thread(ThreadId(4))
            .monitor_entry(2, 200)
            .new_thread(&NewThread {
                thread_id: ThreadId(5),
                name: "worker".into(),
                class_name: "java.lang.Thread".into(),
            });

        let mut rec = Recorder::default();
        let mut decoder = FrameDecoder::new();
        decoder.decode(w.as_bytes(), &mut [&mut rec]).unwrap();
        assert_eq!(
            rec.seen,
            vec!["enter None 1", "enter Some(ThreadId(4)) 2", "thread 5 worker"]
        );

        // The selected thread survives into the next buffer.
        let mut next = FrameWriter::new();
        next.monitor_entry(3, 300);
        let mut rec = Recorder::default();
        decoder.decode(next.as_bytes(), &mut [&mut rec]).unwrap();
        assert_eq!(rec.seen, vec!["enter Some(ThreadId(4)) 3"]);
    }

    #[test]
    fn unknown_tag_stops_after_dispatching_earlier_records() {
        let mut w = FrameWriter::new();
        w.alloc_stack_trace(&alloc(0, 8, &[1])).raw(0xEE).reset_collectors();

        let mut rec = Recorder::default();
        let err = FrameDecoder::new()
            .decode(w.as_bytes(), &mut [&mut rec])
            .unwrap_err();
        assert!(matches!(err, FrameError::UnknownTag { tag: 0xEE, offset: 15 }));
        assert_eq!(rec.seen.len(), 1);
    }

    #[test]
    fn truncated_record_is_not_dispatched() {
        let mut w = FrameWriter::new();
        w.alloc_stack_trace(&alloc(0, 8, &[1, 2]));
        let bytes = w.into_bytes();
        let cut = &bytes[..bytes.len() - 2];

        let mut rec = Recorder::default();
        let err = FrameDecoder::new().decode(cut, &mut [&mut rec]).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Truncated {
                tag: FrameTag::ObjAllocStackTrace,
                offset: 0,
                needed: 2
            }
        ));
        assert!(rec.seen.is_empty());
    }

    #[test]
    fn failing_listener_does_not_starve_others() {
        let mut w = FrameWriter::new();
        w.alloc_stack_trace(&alloc(0, 8, &[1]))
            .alloc_stack_trace(&alloc(0, 8, &[2]));

        let mut failing = Failing;
        let mut rec = Recorder::default();
        let n = FrameDecoder::new()
            .decode(w.as_bytes(), &mut [&mut failing, &mut rec])
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(rec.seen.len(), 2);
    }

    #[test]
    fn empty_buffer_is_fine() {
        let n = FrameDecoder::new().decode(&[], &mut []).unwrap();
        assert_eq!(n, 0);
    }
}
