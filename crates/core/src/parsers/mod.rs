pub mod frames;

pub use frames::{FrameDecoder, FrameError, FrameListener, ListenerError};
