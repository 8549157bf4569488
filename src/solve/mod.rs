pub mod detector;
pub mod executor;
pub mod template;
pub mod vision;

pub use detector::ChallengeDetector;
pub use executor::{ActionExecutor, SolveBudget, SolveOutcome};

use crate::core::types::Frame;
use anyhow::Result;
use async_trait::async_trait;

/// Page operations the Solve phase needs, as a seam so the executor and the
/// detector strategies can be driven against a scripted page in tests.
/// `FrameSource` is the production implementation.
#[async_trait]
pub trait ChallengePage: Send + Sync {
    /// Capture a full-viewport frame.
    async fn snapshot(&self) -> Result<Frame>;
    /// Evaluate a JS expression, returning its JSON value.
    async fn eval_json(&self, js: &str) -> Result<serde_json::Value>;
    /// Current rendered HTML.
    async fn rendered_html(&self) -> Result<String>;
    /// Jittered simulated tap at page coordinates, with settle delay.
    async fn tap(&self, x: f64, y: f64) -> Result<()>;
    /// Ground truth: a playable media element exists.
    async fn media_ready(&self) -> bool;
    /// Viewport size (width, height).
    fn viewport(&self) -> (u32, u32);
}
