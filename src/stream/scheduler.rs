//! `CaptureScheduler` — one repeating timer per streaming session.
//!
//! Overlap policy: at most one capture in flight per session; a tick that
//! lands while the previous capture is still running is skipped, never
//! queued. The in-flight guard covers the capture step only — frames are
//! handed to the sink after the guard clears, so upload latency never
//! throttles capture cadence.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stream::uploader::frame_filename;
use crate::stream::{FrameSink, StreamSurface};

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive capture failures treated as a dead browser.
const SURFACE_LOST_AFTER: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    Cancelled,
    /// Captures failed many times in a row — the page or browser is gone.
    SurfaceLost,
}

pub struct CaptureScheduler<S: StreamSurface, K: FrameSink> {
    surface: Arc<S>,
    sink: Arc<K>,
    interval: Duration,
    frames_dir: Option<PathBuf>,
    in_flight: Arc<AtomicBool>,
    consecutive_failures: Arc<AtomicU32>,
}

impl<S: StreamSurface, K: FrameSink> Clone for CaptureScheduler<S, K> {
    fn clone(&self) -> Self {
        Self {
            surface: Arc::clone(&self.surface),
            sink: Arc::clone(&self.sink),
            interval: self.interval,
            frames_dir: self.frames_dir.clone(),
            in_flight: Arc::clone(&self.in_flight),
            consecutive_failures: Arc::clone(&self.consecutive_failures),
        }
    }
}

impl<S: StreamSurface, K: FrameSink> CaptureScheduler<S, K> {
    pub fn new(
        surface: Arc<S>,
        sink: Arc<K>,
        interval: Duration,
        frames_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            surface,
            sink,
            interval,
            frames_dir,
            in_flight: Arc::new(AtomicBool::new(false)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Tick until cancelled or the surface is considered lost.
    pub async fn run(&self, cancel: CancellationToken) -> SchedulerExit {
        if let Some(dir) = &self.frames_dir {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!("scheduler: cannot create frames dir {}: {}", dir.display(), e);
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval() fires immediately; skip the zero-delay first tick.
        ticker.tick().await;

        info!("scheduler: capturing every {:?}", self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.consecutive_failures.load(Ordering::SeqCst) >= SURFACE_LOST_AFTER {
                        warn!(
                            "scheduler: {} consecutive capture failures — surface lost",
                            SURFACE_LOST_AFTER
                        );
                        return SchedulerExit::SurfaceLost;
                    }
                    // Each tick runs independently so a slow capture skips the
                    // next tick instead of delaying it.
                    let worker = self.clone();
                    tokio::spawn(async move { worker.tick().await });
                }
                _ = cancel.cancelled() => {
                    info!("scheduler: stop requested");
                    return SchedulerExit::Cancelled;
                }
            }
        }
    }

    async fn tick(&self) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("scheduler: capture already in flight — skipping tick");
            return;
        }

        // Prefer the live media element's box; fall back to the whole page.
        let clip = self.surface.media_box().await;

        let captured = match tokio::time::timeout(CAPTURE_TIMEOUT, self.surface.capture(clip)).await
        {
            Ok(Ok(frame)) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                Some(frame)
            }
            Ok(Err(e)) => {
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                warn!("scheduler: capture failed — skipping tick: {}", e);
                None
            }
            Err(_) => {
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                warn!("scheduler: capture timed out (> {:?}) — skipping tick", CAPTURE_TIMEOUT);
                None
            }
        };

        let Some(frame) = captured else {
            self.in_flight.store(false, Ordering::SeqCst);
            return;
        };

        if let Some(dir) = &self.frames_dir {
            let path = dir.join(frame_filename(frame.captured_at));
            if let Err(e) = tokio::fs::write(&path, &frame.bytes).await {
                warn!("scheduler: debug frame write failed ({}): {}", path.display(), e);
            }
        }

        // Capture step is done; release the guard before delivery so upload
        // time never blocks the next tick.
        self.in_flight.store(false, Ordering::SeqCst);
        self.sink.deliver(frame).await;
    }
}
