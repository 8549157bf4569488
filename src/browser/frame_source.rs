//! `FrameSource` — owns one headless browser page and exposes the capture /
//! tap / media-query primitives everything else is built on.

use anyhow::{anyhow, Result};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, Viewport as ClipViewport,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::browser::chrome;
use crate::core::types::{Frame, Rect};

#[derive(Debug, Clone)]
pub struct FrameSourceOptions {
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub nav_timeout: Duration,
    pub tap_jitter_px: u32,
    pub tap_settle: Duration,
    pub jpeg_quality: i64,
}

impl Default for FrameSourceOptions {
    fn default() -> Self {
        Self {
            viewport_width: 1280,
            viewport_height: 800,
            nav_timeout: Duration::from_secs(20),
            tap_jitter_px: 6,
            tap_settle: Duration::from_secs(2),
            // Speed over fidelity: frames are diffed and relayed, not archived.
            jpeg_quality: 70,
        }
    }
}

/// One browser, one page, owned for the lifetime of a session. Only the
/// session's own orchestration calls these methods — no page state is mutated
/// from outside.
pub struct FrameSource {
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler_task: tokio::task::JoinHandle<()>,
    opts: FrameSourceOptions,
}

impl FrameSource {
    /// Launch a headless browser and navigate to `page_url`.
    ///
    /// Navigation timeout is deliberately non-fatal: a frozen or partial page
    /// is handled by the fail-open budgets downstream, not by blocking here.
    pub async fn launch(page_url: &str, opts: FrameSourceOptions) -> Result<Self> {
        let exe = chrome::find_chrome_executable().ok_or_else(|| {
            anyhow!(
                "No browser found. Install Chrome or Chromium, \
                 or set CHROME_EXECUTABLE to its path."
            )
        })?;

        info!(
            "frame_source: launching headless {} @ {}×{} → {}",
            exe, opts.viewport_width, opts.viewport_height, page_url
        );

        let config =
            chrome::build_headless_config(&exe, opts.viewport_width, opts.viewport_height)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| anyhow!("browser launch failed ({}): {}", exe, e))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("CDP handler error: {}", e);
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| anyhow!("new_page failed: {}", e))?;

        match tokio::time::timeout(opts.nav_timeout, page.goto(page_url)).await {
            Ok(Ok(_)) => {
                let _ = tokio::time::timeout(opts.nav_timeout, page.wait_for_navigation()).await;
            }
            Ok(Err(e)) => {
                warn!("navigation to {} failed (non-fatal, solve proceeds): {}", page_url, e)
            }
            Err(_) => warn!(
                "navigation to {} timed out after {:?} (non-fatal, solve proceeds)",
                page_url, opts.nav_timeout
            ),
        }

        // Brief settle to let lazy-loaded elements appear (spinner removal, etc.)
        tokio::time::sleep(Duration::from_millis(1200)).await;

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page,
            handler_task,
            opts,
        })
    }

    pub fn viewport(&self) -> (u32, u32) {
        (self.opts.viewport_width, self.opts.viewport_height)
    }

    /// Capture the current page as an encoded JPEG frame, optionally clipped.
    ///
    /// The clip is already clamped (`Rect::clamped`) to non-negative integer
    /// coordinates and an at-least-1×1 size.
    pub async fn capture_frame(&self, clip: Option<Rect>) -> Result<Frame> {
        let mut params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Jpeg)
            .quality(self.opts.jpeg_quality);
        if let Some(c) = clip {
            params = params.clip(ClipViewport {
                x: c.x as f64,
                y: c.y as f64,
                width: c.width as f64,
                height: c.height as f64,
                scale: 1.0,
            });
        }

        let bytes = self
            .page
            .screenshot(params.build())
            .await
            .map_err(|e| anyhow!("screenshot capture failed: {}", e))?;

        let (width, height) = decoded_dimensions(&bytes).unwrap_or_else(|| match clip {
            Some(c) => (c.width, c.height),
            None => (self.opts.viewport_width, self.opts.viewport_height),
        });

        Ok(Frame::jpeg(bytes, width, height))
    }

    /// Simulated pointer tap with uniform jitter on both axes, followed by a
    /// fixed settle delay. The slowness is intentional — it reads as human and
    /// gives challenge scripts time to react.
    pub async fn tap(&self, x: f64, y: f64, jitter_px: u32) -> Result<()> {
        let (dx, dy) = {
            let mut rng = rand::rng();
            let j = jitter_px as f64;
            if j > 0.0 {
                (rng.random_range(-j..=j), rng.random_range(-j..=j))
            } else {
                (0.0, 0.0)
            }
        };
        let x = (x + dx).max(0.0);
        let y = (y + dy).max(0.0);

        info!("tap: ({:.0},{:.0}) jitter=±{}px", x, y, jitter_px);

        let moved = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(x)
            .y(y)
            .build()
            .map_err(|e| anyhow!("mouse move params: {}", e))?;
        self.page
            .execute(moved)
            .await
            .map_err(|e| anyhow!("mouse move failed: {}", e))?;

        let pressed = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MousePressed)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(|e| anyhow!("mouse press params: {}", e))?;
        self.page
            .execute(pressed)
            .await
            .map_err(|e| anyhow!("mouse press failed: {}", e))?;

        let released = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseReleased)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(|e| anyhow!("mouse release params: {}", e))?;
        self.page
            .execute(released)
            .await
            .map_err(|e| anyhow!("mouse release failed: {}", e))?;

        tokio::time::sleep(self.opts.tap_settle).await;
        Ok(())
    }

    /// Ground truth for the solve phase: a playable media surface is present.
    pub async fn has_media_element(&self) -> bool {
        self.eval_json_value("!!document.querySelector('video, canvas')")
            .await
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Bounding box of the media element, when one exists and is visibly sized.
    pub async fn media_element_box(&self) -> Option<Rect> {
        let js = r#"(() => {
            const el = document.querySelector('video, canvas');
            if (!el) return null;
            const r = el.getBoundingClientRect();
            if (!r || r.width < 2 || r.height < 2) return null;
            return { x: r.x, y: r.y, w: r.width, h: r.height };
        })()"#;
        let v = self.eval_json_value(js).await?;
        let x = v.get("x")?.as_f64()?;
        let y = v.get("y")?.as_f64()?;
        let w = v.get("w")?.as_f64()?;
        let h = v.get("h")?.as_f64()?;
        Some(Rect::clamped(x, y, w, h))
    }

    async fn eval_json_value(&self, js: &str) -> Option<serde_json::Value> {
        self.page
            .evaluate(js)
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
    }

    /// Best-effort teardown. Close-time errors are swallowed — cancellation is
    /// always terminal.
    pub async fn close(&self) {
        let mut guard = self.browser.lock().await;
        if let Some(mut browser) = guard.take() {
            if let Err(e) = browser.close().await {
                warn!("browser close error (non-fatal): {}", e);
            }
        }
        self.handler_task.abort();
        info!("frame_source: closed");
    }
}

fn decoded_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[async_trait::async_trait]
impl crate::solve::ChallengePage for FrameSource {
    async fn snapshot(&self) -> Result<Frame> {
        self.capture_frame(None).await
    }

    async fn eval_json(&self, js: &str) -> Result<serde_json::Value> {
        self.eval_json_value(js)
            .await
            .ok_or_else(|| anyhow!("page evaluate returned no value"))
    }

    async fn rendered_html(&self) -> Result<String> {
        self.page
            .content()
            .await
            .map_err(|e| anyhow!("failed to get page content: {}", e))
    }

    async fn tap(&self, x: f64, y: f64) -> Result<()> {
        FrameSource::tap(self, x, y, self.opts.tap_jitter_px).await
    }

    async fn media_ready(&self) -> bool {
        self.has_media_element().await
    }

    fn viewport(&self) -> (u32, u32) {
        FrameSource::viewport(self)
    }
}

#[async_trait::async_trait]
impl crate::stream::StreamSurface for FrameSource {
    async fn capture(&self, clip: Option<Rect>) -> Result<Frame> {
        self.capture_frame(clip).await
    }

    async fn media_box(&self) -> Option<Rect> {
        self.media_element_box().await
    }
}
