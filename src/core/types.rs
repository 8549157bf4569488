use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Axis-aligned rectangle in page coordinates (top-left origin).
///
/// Produced by clamping raw floating-point element boxes, so coordinates are
/// always non-negative integers and the size is at least 1×1 — a degenerate
/// clip would make the CDP screenshot call fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// Clamp a raw bounding box to non-negative integer coordinates and an
    /// at-least-1×1 size.
    pub fn clamped(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x: x.max(0.0).floor() as u32,
            y: y.max(0.0).floor() as u32,
            width: (width.max(1.0).round() as u32).max(1),
            height: (height.max(1.0).round() as u32).max(1),
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }
}

/// Click target expressed as a center point plus extent, the way the vision
/// endpoint reports boxes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub center_x: f64,
    pub center_y: f64,
    pub width: f64,
    pub height: f64,
}

impl Target {
    pub fn from_rect(rect: Rect) -> Self {
        let (cx, cy) = rect.center();
        Self {
            center_x: cx,
            center_y: cy,
            width: rect.width as f64,
            height: rect.height as f64,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameEncoding {
    Jpeg,
}

/// One captured frame. Immutable once produced; ownership moves to whichever
/// component consumes it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub encoding: FrameEncoding,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn jpeg(bytes: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            bytes,
            encoding: FrameEncoding::Jpeg,
            width,
            height,
            captured_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Detector output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SuggestionKind {
    /// Click the suggested target. The label names what the detector believes
    /// it found ("checkbox", "join_button", ...), for logging only.
    ClickTarget(String),
    /// A candidate was seen but confidence is below the floor — pace retries
    /// instead of escalating to a fallback click.
    Wait,
    None,
}

/// Zero-or-one suggestion produced per Solve tick. Never retained across ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSuggestion {
    pub kind: SuggestionKind,
    pub target: Option<Target>,
    pub confidence: f64,
}

impl ActionSuggestion {
    pub fn none() -> Self {
        Self {
            kind: SuggestionKind::None,
            target: None,
            confidence: 0.0,
        }
    }

    pub fn wait(confidence: f64) -> Self {
        Self {
            kind: SuggestionKind::Wait,
            target: None,
            confidence,
        }
    }

    pub fn click(label: impl Into<String>, target: Target, confidence: f64) -> Self {
        Self {
            kind: SuggestionKind::ClickTarget(label.into()),
            target: Some(target),
            confidence,
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == SuggestionKind::None
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Launching,
    Solving,
    VerifyingMotion,
    Streaming,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// Whether the session still owns live resources (browser, timer).
    pub fn is_active(self) -> bool {
        !matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

/// One upload attempt, for logging only — never persisted, never retried.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub filename: String,
    pub size_bytes: usize,
    pub outcome: Result<u16, String>,
    pub latency_ms: u64,
}

// ---------------------------------------------------------------------------
// Control surface payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub host: Option<String>,
    pub full_url: Option<String>,
    pub stream_id: Option<String>,
    pub password: Option<String>,
    pub interval_sec: Option<u64>,
    pub upload_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub page_url: String,
    pub interval_sec: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solve_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Resolve the page to open from a start request.
///
/// `full_url` wins when present; otherwise the URL is assembled from
/// `host` + `stream_id`, with the password carried as a query parameter.
pub fn resolve_page_url(req: &StartRequest) -> anyhow::Result<String> {
    if let Some(u) = req.full_url.as_deref() {
        let u = u.trim();
        if !u.is_empty() {
            url::Url::parse(u).map_err(|e| anyhow::anyhow!("invalid full_url: {}", e))?;
            return Ok(u.to_string());
        }
    }

    let host = req
        .host
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow::anyhow!("start request needs either full_url or host"))?;
    let stream_id = req
        .stream_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("start request needs stream_id when host is used"))?;

    let base = if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", host.trim_end_matches('/'))
    };

    let mut page_url = url::Url::parse(&format!("{}/{}", base, stream_id))
        .map_err(|e| anyhow::anyhow!("invalid host/stream_id: {}", e))?;
    if let Some(pwd) = req.password.as_deref().filter(|p| !p.is_empty()) {
        page_url.query_pairs_mut().append_pair("pwd", pwd);
    }
    Ok(page_url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_clamps_negative_and_degenerate() {
        let r = Rect::clamped(-12.4, -0.5, 0.0, -3.0);
        assert_eq!(r, Rect { x: 0, y: 0, width: 1, height: 1 });
    }

    #[test]
    fn rect_keeps_requested_clip_size() {
        let r = Rect::clamped(10.0, 10.0, 100.0, 50.0);
        assert_eq!(r.x, 10);
        assert_eq!(r.y, 10);
        assert_eq!(r.width, 100);
        assert_eq!(r.height, 50);
    }

    #[test]
    fn target_center_from_rect() {
        let t = Target::from_rect(Rect { x: 100, y: 200, width: 40, height: 20 });
        assert_eq!(t.center_x, 120.0);
        assert_eq!(t.center_y, 210.0);
    }

    #[test]
    fn page_url_prefers_full_url() {
        let req = StartRequest {
            host: Some("ignored.example".into()),
            full_url: Some("https://cam.example/live/77".into()),
            stream_id: Some("77".into()),
            password: None,
            interval_sec: None,
            upload_url: None,
        };
        assert_eq!(resolve_page_url(&req).unwrap(), "https://cam.example/live/77");
    }

    #[test]
    fn page_url_from_host_and_stream_with_password() {
        let req = StartRequest {
            host: Some("cam.example".into()),
            full_url: None,
            stream_id: Some("abc123".into()),
            password: Some("s3cret".into()),
            interval_sec: None,
            upload_url: None,
        };
        assert_eq!(
            resolve_page_url(&req).unwrap(),
            "https://cam.example/abc123?pwd=s3cret"
        );
    }

    #[test]
    fn page_url_rejects_empty_request() {
        let req = StartRequest {
            host: None,
            full_url: None,
            stream_id: None,
            password: None,
            interval_sec: None,
            upload_url: None,
        };
        assert!(resolve_page_url(&req).is_err());
    }
}
