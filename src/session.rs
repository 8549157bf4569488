//! Session orchestration: Launch → Solve → VerifyMotion → Stream.
//!
//! A session is an explicit value owned by the control surface — no
//! module-level singleton. All state transitions happen on the session's own
//! task; Solve and VerifyMotion are each individually fail-open, and only a
//! crashed browser escalates to `Failed`.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::browser::{FrameSource, FrameSourceOptions};
use crate::core::config::RelayConfig;
use crate::core::types::{SessionState, StatusResponse};
use crate::solve::{ActionExecutor, ChallengeDetector, SolveBudget};
use crate::stream::scheduler::SchedulerExit;
use crate::stream::{CaptureScheduler, MotionConfig, MotionVerifier, Uploader};

const STOP_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session is already active")]
    AlreadyActive,

    #[error("invalid start request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub page_url: String,
    pub capture_interval: Duration,
    pub upload_url: String,
}

struct SessionShared {
    state: RwLock<SessionState>,
    solve_attempts: AtomicU32,
}

impl SessionShared {
    fn set_state(&self, next: SessionState) {
        *self.state.write().unwrap() = next;
        info!("session_state={:?}", next);
    }

    fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }
}

/// Owning handle for one live session. Dropping it does not stop the session;
/// call `stop()`.
pub struct SessionHandle {
    pub id: uuid::Uuid,
    pub page_url: String,
    pub interval_sec: u64,
    pub started_at: DateTime<Utc>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl SessionHandle {
    /// Spawn the orchestration task for a new session.
    pub fn spawn(
        http_client: reqwest::Client,
        relay_cfg: Arc<RelayConfig>,
        cfg: SessionConfig,
    ) -> Self {
        let id = uuid::Uuid::new_v4();
        let shared = Arc::new(SessionShared {
            state: RwLock::new(SessionState::Idle),
            solve_attempts: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();

        info!(
            "session {}: starting for {} (interval {:?})",
            id, cfg.page_url, cfg.capture_interval
        );

        let task = tokio::spawn(run_session(
            http_client,
            relay_cfg,
            cfg.clone(),
            Arc::clone(&shared),
            cancel.clone(),
        ));

        Self {
            id,
            page_url: cfg.page_url,
            interval_sec: cfg.capture_interval.as_secs(),
            started_at: Utc::now(),
            shared,
            cancel,
            task,
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            running: self.is_active(),
            page_url: Some(self.page_url.clone()),
            interval_sec: Some(self.interval_sec),
            state: Some(self.state()),
            solve_attempts: Some(self.shared.solve_attempts.load(Ordering::Relaxed)),
            started_at: Some(self.started_at),
        }
    }

    /// Best-effort, always-terminal stop: cancel the timer and phases, then
    /// wait (bounded) for the task to release the browser.
    pub async fn stop(self) {
        let SessionHandle {
            id,
            shared,
            cancel,
            task,
            ..
        } = self;

        if shared.state().is_active() {
            shared.set_state(SessionState::Stopping);
        }
        cancel.cancel();

        match tokio::time::timeout(STOP_GRACE, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("session {}: task join error on stop: {}", id, e),
            Err(_) => warn!("session {}: stop timed out after {:?}", id, STOP_GRACE),
        }

        if shared.state().is_active() {
            shared.set_state(SessionState::Stopped);
        }
        info!("session {}: stopped", id);
    }
}

async fn run_session(
    http_client: reqwest::Client,
    relay_cfg: Arc<RelayConfig>,
    cfg: SessionConfig,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
) {
    shared.set_state(SessionState::Launching);

    let opts = FrameSourceOptions {
        tap_jitter_px: relay_cfg.resolve_tap_jitter_px(),
        tap_settle: relay_cfg.resolve_tap_settle(),
        ..FrameSourceOptions::default()
    };

    let source = tokio::select! {
        launched = FrameSource::launch(&cfg.page_url, opts) => match launched {
            Ok(s) => s,
            Err(e) => {
                error!("session: browser launch failed: {}", e);
                shared.set_state(SessionState::Failed);
                return;
            }
        },
        _ = cancel.cancelled() => {
            shared.set_state(SessionState::Stopped);
            return;
        }
    };

    // Solve — fail-open: giving up is not an error.
    shared.set_state(SessionState::Solving);
    let detector = ChallengeDetector::from_config(&relay_cfg, http_client.clone());
    let executor = ActionExecutor::new(SolveBudget {
        max_attempts: relay_cfg.resolve_solve_max_attempts(),
        max_duration: relay_cfg.resolve_solve_max_duration(),
        ..SolveBudget::default()
    });

    tokio::select! {
        outcome = executor.run(&detector, &source) => {
            shared.solve_attempts.store(outcome.attempts, Ordering::Relaxed);
            if !outcome.solved {
                warn!("session: solve gave up — proceeding to motion check anyway");
            }
        }
        _ = cancel.cancelled() => {
            source.close().await;
            shared.set_state(SessionState::Stopped);
            return;
        }
    }

    // VerifyMotion — same fail-open policy.
    shared.set_state(SessionState::VerifyingMotion);
    let verifier = MotionVerifier::new(MotionConfig {
        samples: relay_cfg.resolve_motion_samples(),
        cadence: relay_cfg.resolve_motion_cadence(),
        channel_delta: relay_cfg.resolve_motion_channel_delta(),
        min_changed_pixels: relay_cfg.resolve_motion_min_changed_pixels(),
        ..MotionConfig::default()
    });

    tokio::select! {
        live = verifier.confirm(&source) => {
            if !live {
                warn!("session: motion unconfirmed — streaming may relay a static frame");
            }
        }
        _ = cancel.cancelled() => {
            source.close().await;
            shared.set_state(SessionState::Stopped);
            return;
        }
    }

    // Stream until cancelled or the browser dies under us.
    shared.set_state(SessionState::Streaming);
    let source = Arc::new(source);
    let uploader = Arc::new(Uploader::new(
        http_client,
        cfg.upload_url.clone(),
        relay_cfg.resolve_upload_timeout(),
    ));
    let scheduler = CaptureScheduler::new(
        Arc::clone(&source),
        uploader,
        cfg.capture_interval,
        Some(relay_cfg.resolve_frames_dir()),
    );

    let exit = scheduler.run(cancel.clone()).await;
    source.close().await;

    match exit {
        SchedulerExit::Cancelled => shared.set_state(SessionState::Stopped),
        SchedulerExit::SurfaceLost => {
            error!("session: browser/page lost during streaming — marking failed");
            shared.set_state(SessionState::Failed);
        }
    }
}
