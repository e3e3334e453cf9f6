use serde::{Deserialize, Serialize};

/// GC generation counter. The agent bumps it once per collection.
pub type Epoch = u32;

/// Index of an instrumented class in the per-class aggregate arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u16);

impl ClassId {
    #[inline]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque jmethodID handed out by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u16);

/// Identity of a tracked object, packed exactly as the agent does it:
///
/// ```text
///   63        48 47        32 31                     0
///  +------------+------------+------------------------+
///  |  class id  | birth epoch|   per-class sequence   |
///  +------------+------------+------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub fn pack(class_id: ClassId, epoch: u16, sequence: u32) -> Self {
        Self((u64::from(class_id.0) << 48) | (u64::from(epoch) << 32) | u64::from(sequence))
    }

    pub fn class_id(self) -> ClassId {
        ClassId((self.0 >> 48) as u16)
    }

    pub fn epoch(self) -> Epoch {
        ((self.0 >> 32) & 0xFFFF) as Epoch
    }

    pub fn sequence(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}
