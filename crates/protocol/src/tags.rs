/// Record tags written by the instrumentation agent into its event buffer.
///
/// The numeric values are part of the agent's wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameTag {
    AdjustTime = 3,
    ObjAllocStackTrace = 8,
    SetFollowingEventsThread = 9,
    NewThread = 10,
    ObjLivenessStackTrace = 15,
    ObjGcHappened = 16,
    ProfilingPointHit = 17,
    NewMonitor = 18,
    MethodEntryMonitor = 19,
    MethodExitMonitor = 20,
    ResetCollectors = 30,
}

impl FrameTag {
    pub const ALL: [FrameTag; 11] = [
        FrameTag::AdjustTime,
        FrameTag::ObjAllocStackTrace,
        FrameTag::SetFollowingEventsThread,
        FrameTag::NewThread,
        FrameTag::ObjLivenessStackTrace,
        FrameTag::ObjGcHappened,
        FrameTag::ProfilingPointHit,
        FrameTag::NewMonitor,
        FrameTag::MethodEntryMonitor,
        FrameTag::MethodExitMonitor,
        FrameTag::ResetCollectors,
    ];

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FrameTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_u8() == value)
            .ok_or(value)
    }
}

impl std::fmt::Display for FrameTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AdjustTime => "ADJUST_TIME",
            Self::ObjAllocStackTrace => "OBJ_ALLOC_STACK_TRACE",
            Self::SetFollowingEventsThread => "SET_FOLLOWING_EVENTS_THREAD",
            Self::NewThread => "NEW_THREAD",
            Self::ObjLivenessStackTrace => "OBJ_LIVENESS_STACK_TRACE",
            Self::ObjGcHappened => "OBJ_GC_HAPPENED",
            Self::ProfilingPointHit => "BUFFEREVENT_PROFILEPOINT_HIT",
            Self::NewMonitor => "NEW_MONITOR",
            Self::MethodEntryMonitor => "METHOD_ENTRY_MONITOR",
            Self::MethodExitMonitor => "METHOD_EXIT_MONITOR",
            Self::ResetCollectors => "RESET_COLLECTORS",
        };
        f.write_str(name)
    }
}
