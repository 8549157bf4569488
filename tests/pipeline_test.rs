/// Pipeline tests: solve loop budgets, capture scheduling, and motion
/// verification, driven against scripted pages and surfaces — no browser.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use feedrelay::core::types::{ActionSuggestion, Frame, Rect, Target};
use feedrelay::solve::detector::DetectStrategy;
use feedrelay::stream::scheduler::SchedulerExit;
use feedrelay::{
    ActionExecutor, CaptureScheduler, ChallengeDetector, ChallengePage, FrameSink, MotionConfig,
    MotionVerifier, SolveBudget, StreamSurface,
};

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

fn tiny_frame() -> Frame {
    Frame::jpeg(vec![0u8; 128], 4, 4)
}

// ---------------------------------------------------------------------------
// Scripted challenge page
// ---------------------------------------------------------------------------

/// A page whose media element "appears" after a configured number of taps.
struct ScriptedPage {
    taps_until_media: u32,
    taps: Mutex<Vec<(f64, f64)>>,
    media_up: AtomicBool,
}

impl ScriptedPage {
    fn new(taps_until_media: u32) -> Self {
        Self {
            taps_until_media,
            taps: Mutex::new(Vec::new()),
            media_up: AtomicBool::new(taps_until_media == 0),
        }
    }

    fn tap_log(&self) -> Vec<(f64, f64)> {
        self.taps.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChallengePage for ScriptedPage {
    async fn snapshot(&self) -> Result<Frame> {
        Ok(tiny_frame())
    }

    async fn eval_json(&self, _js: &str) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn rendered_html(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn tap(&self, x: f64, y: f64) -> Result<()> {
        let mut taps = self.taps.lock().unwrap();
        taps.push((x, y));
        if taps.len() as u32 >= self.taps_until_media && self.taps_until_media > 0 {
            self.media_up.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn media_ready(&self) -> bool {
        self.media_up.load(Ordering::SeqCst)
    }

    fn viewport(&self) -> (u32, u32) {
        (1280, 800)
    }
}

/// Strategy that always points at the same target.
struct FixedClick;

#[async_trait]
impl DetectStrategy for FixedClick {
    fn name(&self) -> &'static str {
        "fixed_click"
    }

    async fn detect(&self, _frame: &Frame, _page: &dyn ChallengePage) -> Result<ActionSuggestion> {
        Ok(ActionSuggestion::click(
            "checkbox",
            Target {
                center_x: 200.0,
                center_y: 300.0,
                width: 24.0,
                height: 24.0,
            },
            0.9,
        ))
    }
}

/// Strategy that always errors — must be absorbed, never surfaced.
struct AlwaysErrors;

#[async_trait]
impl DetectStrategy for AlwaysErrors {
    fn name(&self) -> &'static str {
        "always_errors"
    }

    async fn detect(&self, _frame: &Frame, _page: &dyn ChallengePage) -> Result<ActionSuggestion> {
        Err(anyhow!("strategy blew up"))
    }
}

fn fast_budget() -> SolveBudget {
    SolveBudget {
        max_attempts: 5,
        max_duration: Duration::from_secs(60),
        blind_tap_after: 3,
        retry_pause: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn solve_gives_up_at_attempt_budget() {
    init_logger();
    let page = ScriptedPage::new(u32::MAX); // media never appears
    let detector = ChallengeDetector::new(vec![]);
    let executor = ActionExecutor::new(SolveBudget {
        blind_tap_after: u32::MAX,
        ..fast_budget()
    });

    let outcome = executor.run(&detector, &page).await;
    assert!(!outcome.solved);
    assert_eq!(outcome.attempts, 5);
}

#[tokio::test(start_paused = true)]
async fn solve_gives_up_at_time_budget() {
    init_logger();
    let page = ScriptedPage::new(u32::MAX);
    let detector = ChallengeDetector::new(vec![]);
    let executor = ActionExecutor::new(SolveBudget {
        max_attempts: u32::MAX,
        max_duration: Duration::from_millis(50),
        blind_tap_after: u32::MAX,
        retry_pause: Duration::from_millis(10),
    });

    let outcome = executor.run(&detector, &page).await;
    assert!(!outcome.solved);
    assert!(outcome.elapsed >= Duration::from_millis(50));
    assert!(outcome.attempts < 100);
}

#[tokio::test]
async fn solve_succeeds_when_media_appears_after_click() {
    init_logger();
    let page = ScriptedPage::new(1);
    let detector = ChallengeDetector::new(vec![Box::new(FixedClick)]);
    let executor = ActionExecutor::new(fast_budget());

    let outcome = executor.run(&detector, &page).await;
    assert!(outcome.solved);
    assert_eq!(page.tap_log(), vec![(200.0, 300.0)]);
}

#[tokio::test]
async fn blind_tap_fires_once_after_consecutive_misses() {
    init_logger();
    let page = ScriptedPage::new(u32::MAX);
    let detector = ChallengeDetector::new(vec![]);
    let executor = ActionExecutor::new(SolveBudget {
        max_attempts: 10,
        ..fast_budget()
    });

    let outcome = executor.run(&detector, &page).await;
    assert!(!outcome.solved);

    // Exactly one blind tap at the conventional widget spot.
    let taps = page.tap_log();
    assert_eq!(taps, vec![(640.0, 600.0)]);
}

#[tokio::test]
async fn strategy_errors_are_absorbed() {
    init_logger();
    let page = ScriptedPage::new(1);
    let detector = ChallengeDetector::new(vec![Box::new(AlwaysErrors), Box::new(FixedClick)]);
    let executor = ActionExecutor::new(fast_budget());

    let outcome = executor.run(&detector, &page).await;
    assert!(outcome.solved, "error in one strategy must not block the next");
}

// ---------------------------------------------------------------------------
// Scripted stream surface + sink
// ---------------------------------------------------------------------------

struct ScriptedSurface {
    capture_delay: Duration,
    fail_all: bool,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    captures: AtomicU32,
}

impl ScriptedSurface {
    fn new(capture_delay: Duration) -> Self {
        Self {
            capture_delay,
            fail_all: false,
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            captures: AtomicU32::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::new(Duration::ZERO)
        }
    }
}

#[async_trait]
impl StreamSurface for ScriptedSurface {
    async fn capture(&self, _clip: Option<Rect>) -> Result<Frame> {
        if self.fail_all {
            return Err(anyhow!("target closed"));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.capture_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(tiny_frame())
    }

    async fn media_box(&self) -> Option<Rect> {
        None
    }
}

struct CountingSink {
    delivered: AtomicU32,
    delay: Duration,
}

impl CountingSink {
    fn new(delay: Duration) -> Self {
        Self {
            delivered: AtomicU32::new(0),
            delay,
        }
    }
}

#[async_trait]
impl FrameSink for CountingSink {
    async fn deliver(&self, _frame: Frame) {
        tokio::time::sleep(self.delay).await;
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn scheduler_never_overlaps_captures() {
    init_logger();
    // Capture takes 5 intervals; ticks in between must be skipped, not queued.
    let surface = std::sync::Arc::new(ScriptedSurface::new(Duration::from_millis(250)));
    let sink = std::sync::Arc::new(CountingSink::new(Duration::ZERO));
    let scheduler = CaptureScheduler::new(
        std::sync::Arc::clone(&surface),
        std::sync::Arc::clone(&sink),
        Duration::from_millis(50),
        None,
    );

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1200)).await;
        stopper.cancel();
    });

    let exit = scheduler.run(cancel).await;
    assert_eq!(exit, SchedulerExit::Cancelled);
    assert_eq!(surface.max_in_flight.load(Ordering::SeqCst), 1);

    // ~1200ms with 250ms captures → roughly 4 completed, never the 24 a
    // queueing scheduler would attempt.
    let captures = surface.captures.load(Ordering::SeqCst);
    assert!((2..=6).contains(&captures), "captures = {}", captures);
}

#[tokio::test(start_paused = true)]
async fn slow_sink_does_not_throttle_capture() {
    init_logger();
    let surface = std::sync::Arc::new(ScriptedSurface::new(Duration::ZERO));
    // Delivery takes 10 intervals; capture cadence must be unaffected.
    let sink = std::sync::Arc::new(CountingSink::new(Duration::from_millis(500)));
    let scheduler = CaptureScheduler::new(
        std::sync::Arc::clone(&surface),
        std::sync::Arc::clone(&sink),
        Duration::from_millis(50),
        None,
    );

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1025)).await;
        stopper.cancel();
    });

    let exit = scheduler.run(cancel).await;
    assert_eq!(exit, SchedulerExit::Cancelled);

    let captures = surface.captures.load(Ordering::SeqCst);
    assert!(captures >= 15, "slow sink throttled capture: {}", captures);
}

#[tokio::test(start_paused = true)]
async fn scheduler_reports_surface_lost() {
    init_logger();
    let surface = std::sync::Arc::new(ScriptedSurface::failing());
    let sink = std::sync::Arc::new(CountingSink::new(Duration::ZERO));
    let scheduler = CaptureScheduler::new(surface, sink, Duration::from_millis(10), None);

    let cancel = CancellationToken::new();
    let exit = tokio::time::timeout(Duration::from_secs(60), scheduler.run(cancel))
        .await
        .expect("scheduler must exit on its own");
    assert_eq!(exit, SchedulerExit::SurfaceLost);
}

// ---------------------------------------------------------------------------
// Motion verification over a scripted surface
// ---------------------------------------------------------------------------

/// Surface that serves alternating (or constant) pre-encoded buffers.
struct ReplaySurface {
    buffers: Vec<Vec<u8>>,
    cursor: AtomicU32,
}

#[async_trait]
impl StreamSurface for ReplaySurface {
    async fn capture(&self, _clip: Option<Rect>) -> Result<Frame> {
        let i = self.cursor.fetch_add(1, Ordering::SeqCst) as usize;
        let buf = self.buffers[i % self.buffers.len()].clone();
        Ok(Frame::jpeg(buf, 0, 0))
    }

    async fn media_box(&self) -> Option<Rect> {
        Some(Rect {
            x: 0,
            y: 0,
            width: 320,
            height: 240,
        })
    }
}

fn motion_cfg() -> MotionConfig {
    MotionConfig {
        samples: 6,
        cadence: Duration::from_millis(1),
        ..MotionConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn motion_confirms_on_changing_surface() {
    init_logger();
    let surface = ReplaySurface {
        buffers: vec![vec![0u8; 64 * 1024], vec![255u8; 64 * 1024]],
        cursor: AtomicU32::new(0),
    };
    assert!(MotionVerifier::new(motion_cfg()).confirm(&surface).await);
}

#[tokio::test(start_paused = true)]
async fn motion_fails_open_on_static_surface() {
    init_logger();
    let surface = ReplaySurface {
        buffers: vec![vec![7u8; 64 * 1024]],
        cursor: AtomicU32::new(0),
    };
    // Static frames: exhausts the budget and reports no motion.
    assert!(!MotionVerifier::new(motion_cfg()).confirm(&surface).await);
}
