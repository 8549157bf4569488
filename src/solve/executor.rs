//! `ActionExecutor` — the bounded solve state machine.
//!
//! One explicit loop replaces per-strategy retry loops: dual attempt/time
//! budgets, paced retries on `Wait`, a single conservative blind tap when no
//! strategy yields anything, and a fail-open `GivingUp` terminal state.
//! Giving up is not an error — a mis-detected or absent challenge must never
//! permanently block streaming.

use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::types::SuggestionKind;
use crate::solve::{ChallengeDetector, ChallengePage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SolveState {
    Probing,
    Clicking,
    Waiting,
    GivingUp,
    Solved,
}

fn log_state(state: SolveState) {
    info!("solve_state={:?}", state);
}

#[derive(Debug, Clone)]
pub struct SolveBudget {
    /// Maximum probe attempts before giving up.
    pub max_attempts: u32,
    /// Maximum wall-clock time before giving up, whichever exhausts first.
    pub max_duration: Duration,
    /// Consecutive no-result probes before the one blind tap fires.
    pub blind_tap_after: u32,
    /// Pause between probes that produced `Wait`/`None`.
    pub retry_pause: Duration,
}

impl Default for SolveBudget {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            max_duration: Duration::from_secs(45),
            blind_tap_after: 4,
            retry_pause: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub solved: bool,
    pub attempts: u32,
    pub elapsed: Duration,
}

pub struct ActionExecutor {
    budget: SolveBudget,
}

impl ActionExecutor {
    pub fn new(budget: SolveBudget) -> Self {
        Self { budget }
    }

    /// Drive the solve loop until media appears or a budget runs out.
    ///
    /// `Solved` triggers on `media_ready()` alone — playable media is the
    /// ground truth, not any single detector's opinion.
    pub async fn run(
        &self,
        detector: &ChallengeDetector,
        page: &dyn ChallengePage,
    ) -> SolveOutcome {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut consecutive_misses = 0u32;
        let mut blind_tap_spent = false;

        loop {
            if page.media_ready().await {
                log_state(SolveState::Solved);
                info!(
                    "solve: media present after {} attempts ({}ms)",
                    attempts,
                    started.elapsed().as_millis()
                );
                return SolveOutcome {
                    solved: true,
                    attempts,
                    elapsed: started.elapsed(),
                };
            }

            if attempts >= self.budget.max_attempts || started.elapsed() >= self.budget.max_duration
            {
                log_state(SolveState::GivingUp);
                warn!(
                    "solve: budget exhausted ({} attempts, {}ms) — failing open",
                    attempts,
                    started.elapsed().as_millis()
                );
                return SolveOutcome {
                    solved: false,
                    attempts,
                    elapsed: started.elapsed(),
                };
            }

            attempts += 1;
            log_state(SolveState::Probing);

            let suggestion = match page.snapshot().await {
                Ok(frame) => detector.detect(&frame, page).await,
                Err(e) => {
                    warn!("solve: frame capture failed (attempt {}): {}", attempts, e);
                    crate::core::types::ActionSuggestion::none()
                }
            };

            match suggestion.kind {
                SuggestionKind::ClickTarget(label) => {
                    log_state(SolveState::Clicking);
                    consecutive_misses = 0;
                    if let Some(t) = suggestion.target {
                        // Tap failures count against the attempt budget only.
                        if let Err(e) = page.tap(t.center_x, t.center_y).await {
                            warn!("solve: tap on {} failed (non-fatal): {}", label, e);
                        }
                    }
                }
                SuggestionKind::Wait => {
                    log_state(SolveState::Waiting);
                    consecutive_misses += 1;
                    tokio::time::sleep(self.budget.retry_pause).await;
                }
                SuggestionKind::None => {
                    consecutive_misses += 1;
                    tokio::time::sleep(self.budget.retry_pause).await;
                }
            }

            if consecutive_misses >= self.budget.blind_tap_after && !blind_tap_spent {
                // Escape hatch: one tap near the empirically common widget
                // location, then back to normal probing.
                blind_tap_spent = true;
                consecutive_misses = 0;
                let (w, h) = page.viewport();
                let (x, y) = (w as f64 / 2.0, h as f64 * 0.75);
                info!("solve: no detector result — blind tap at ({:.0},{:.0})", x, y);
                if let Err(e) = page.tap(x, y).await {
                    warn!("solve: blind tap failed (non-fatal): {}", e);
                }
            }
        }
    }
}
