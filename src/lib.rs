pub mod browser;
pub mod core;
pub mod session;
pub mod solve;
pub mod stream;

// --- Primary core exports ---
pub use core::types;
pub use core::types::*;
pub use core::AppState;

pub use browser::{FrameSource, FrameSourceOptions};
pub use session::{SessionConfig, SessionError, SessionHandle};
pub use solve::{ActionExecutor, ChallengeDetector, ChallengePage, SolveBudget, SolveOutcome};
pub use stream::{CaptureScheduler, FrameSink, MotionConfig, MotionVerifier, StreamSurface, Uploader};
