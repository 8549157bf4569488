pub mod motion;
pub mod scheduler;
pub mod uploader;

pub use motion::{MotionConfig, MotionVerifier};
pub use scheduler::CaptureScheduler;
pub use uploader::Uploader;

use crate::core::types::{Frame, Rect};
use anyhow::Result;
use async_trait::async_trait;

/// Capture operations the streaming phase needs. `FrameSource` is the
/// production implementation; tests substitute scripted surfaces.
#[async_trait]
pub trait StreamSurface: Send + Sync + 'static {
    async fn capture(&self, clip: Option<Rect>) -> Result<Frame>;
    /// Bounding box of the live media element, when one exists.
    async fn media_box(&self) -> Option<Rect>;
}

/// Consumes captured frames. Must absorb its own failures — delivery problems
/// never feed back into capture cadence or session state.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn deliver(&self, frame: Frame);
}
