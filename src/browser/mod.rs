pub mod chrome;
pub mod frame_source;

pub use frame_source::{FrameSource, FrameSourceOptions};
