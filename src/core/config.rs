use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// RelayConfig — file-based config loader (feedrelay.json) with env-var fallback
// ---------------------------------------------------------------------------

/// Vision sub-config (mirrors the `vision` key in feedrelay.json).
///
/// The vision strategy talks to any OpenAI-compatible multimodal endpoint.
/// A missing API key disables this strategy only — the text and template
/// strategies still run.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct VisionConfig {
    /// Endpoint base — e.g. `https://api.openai.com/v1` or `http://localhost:11434/v1`.
    pub base_url: Option<String>,
    /// API key. Never logged. Leave blank for key-less local endpoints.
    pub api_key: Option<String>,
    /// Model name — e.g. `gpt-4o-mini`, `llava`.
    pub model: Option<String>,
}

impl VisionConfig {
    /// API key: JSON field → `VISION_API_KEY` → `OPENAI_API_KEY` → `None`.
    ///
    /// An explicit empty string in the config file means "no key required"
    /// (local endpoint) — the strategy stays enabled without auth.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.trim().to_string());
        }
        for var in ["VISION_API_KEY", "OPENAI_API_KEY"] {
            if let Ok(v) = std::env::var(var) {
                if !v.trim().is_empty() {
                    return Some(v.trim().to_string());
                }
            }
        }
        None
    }

    /// Base URL: JSON field → `VISION_BASE_URL` → `OPENAI_BASE_URL` → OpenAI default.
    pub fn resolve_base_url(&self) -> String {
        if let Some(u) = &self.base_url {
            if !u.trim().is_empty() {
                return u.clone();
            }
        }
        for var in ["VISION_BASE_URL", "OPENAI_BASE_URL"] {
            if let Ok(v) = std::env::var(var) {
                if !v.trim().is_empty() {
                    return v;
                }
            }
        }
        "https://api.openai.com/v1".to_string()
    }

    /// Model: JSON field → `VISION_MODEL` env var → `gpt-4o-mini`.
    pub fn resolve_model(&self) -> String {
        if let Some(m) = &self.model {
            if !m.trim().is_empty() {
                return m.clone();
            }
        }
        std::env::var("VISION_MODEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }
}

/// Top-level config loaded from `feedrelay.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct RelayConfig {
    #[serde(default)]
    pub vision: VisionConfig,

    /// Marker phrases the text strategy scans rendered text for.
    pub marker_phrases: Option<Vec<String>>,
    /// Path to the reference icon bitmap for template matching. Strategy is
    /// disabled when unset or unreadable.
    pub template_icon_path: Option<String>,
    /// Mean-squared-error tolerance for a template window to count as a match.
    pub template_tolerance: Option<f64>,
    /// Detector confidence floor; candidates below it yield `Wait`.
    pub confidence_floor: Option<f64>,

    /// Solve budgets.
    pub solve_max_attempts: Option<u32>,
    pub solve_max_secs: Option<u64>,

    /// Motion verification knobs.
    pub motion_samples: Option<u32>,
    pub motion_cadence_ms: Option<u64>,
    pub motion_channel_delta: Option<u8>,
    pub motion_min_changed_pixels: Option<u64>,

    /// Streaming defaults.
    pub default_interval_sec: Option<u64>,
    pub default_upload_url: Option<String>,
    pub upload_timeout_secs: Option<u64>,
    pub frames_dir: Option<String>,

    /// Simulated input.
    pub tap_jitter_px: Option<u32>,
    pub tap_settle_secs: Option<u64>,
}

impl RelayConfig {
    pub fn resolve_marker_phrases(&self) -> Vec<String> {
        if let Some(p) = &self.marker_phrases {
            if !p.is_empty() {
                return p.clone();
            }
        }
        if let Ok(v) = std::env::var("FEEDRELAY_MARKER_PHRASES") {
            let phrases: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !phrases.is_empty() {
                return phrases;
            }
        }
        // Conventional wording on verification interstitials and join gates.
        vec![
            "verify you are human".to_string(),
            "i'm not a robot".to_string(),
            "i am not a robot".to_string(),
            "prove you are human".to_string(),
            "join stream".to_string(),
            "join now".to_string(),
        ]
    }

    pub fn resolve_template_icon_path(&self) -> Option<PathBuf> {
        if let Some(p) = &self.template_icon_path {
            if !p.trim().is_empty() {
                return Some(PathBuf::from(p.trim()));
            }
        }
        std::env::var("FEEDRELAY_TEMPLATE_ICON")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
    }

    pub fn resolve_template_tolerance(&self) -> f64 {
        self.template_tolerance.unwrap_or_else(|| {
            std::env::var("FEEDRELAY_TEMPLATE_TOLERANCE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(900.0)
        })
    }

    pub fn resolve_confidence_floor(&self) -> f64 {
        self.confidence_floor.unwrap_or_else(|| {
            std::env::var("FEEDRELAY_CONFIDENCE_FLOOR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.5)
        })
    }

    pub fn resolve_solve_max_attempts(&self) -> u32 {
        self.solve_max_attempts.unwrap_or_else(|| {
            std::env::var("FEEDRELAY_SOLVE_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30)
        })
    }

    pub fn resolve_solve_max_duration(&self) -> Duration {
        let secs = self.solve_max_secs.unwrap_or_else(|| {
            std::env::var("FEEDRELAY_SOLVE_MAX_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(45)
        });
        Duration::from_secs(secs)
    }

    pub fn resolve_motion_samples(&self) -> u32 {
        self.motion_samples.unwrap_or_else(|| {
            std::env::var("FEEDRELAY_MOTION_SAMPLES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20)
        })
    }

    pub fn resolve_motion_cadence(&self) -> Duration {
        let ms = self.motion_cadence_ms.unwrap_or_else(|| {
            std::env::var("FEEDRELAY_MOTION_CADENCE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(400)
        });
        Duration::from_millis(ms)
    }

    pub fn resolve_motion_channel_delta(&self) -> u8 {
        self.motion_channel_delta.unwrap_or(24)
    }

    pub fn resolve_motion_min_changed_pixels(&self) -> u64 {
        self.motion_min_changed_pixels.unwrap_or(400)
    }

    pub fn resolve_default_interval_sec(&self) -> u64 {
        self.default_interval_sec.unwrap_or_else(|| {
            std::env::var("FEEDRELAY_INTERVAL_SEC")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3)
        })
    }

    pub fn resolve_default_upload_url(&self) -> Option<String> {
        if let Some(u) = &self.default_upload_url {
            if !u.trim().is_empty() {
                return Some(u.clone());
            }
        }
        std::env::var("FEEDRELAY_UPLOAD_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    pub fn resolve_upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs.unwrap_or(15))
    }

    /// Directory for locally persisted debug frames. Created on demand.
    pub fn resolve_frames_dir(&self) -> PathBuf {
        if let Some(d) = &self.frames_dir {
            if !d.trim().is_empty() {
                return PathBuf::from(d.trim());
            }
        }
        std::env::var("FEEDRELAY_FRAMES_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join(".feedrelay-frames"))
    }

    pub fn resolve_tap_jitter_px(&self) -> u32 {
        self.tap_jitter_px.unwrap_or(6)
    }

    pub fn resolve_tap_settle(&self) -> Duration {
        Duration::from_secs(self.tap_settle_secs.unwrap_or(2))
    }
}

/// Load `feedrelay.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `FEEDRELAY_CONFIG` env var path
/// 2. `./feedrelay.json`
/// 3. `../feedrelay.json`
///
/// Missing file → `RelayConfig::default()` (silent, all env-var fallbacks apply).
/// Parse error → log a warning, return `RelayConfig::default()`.
pub fn load_relay_config() -> RelayConfig {
    let candidates: Vec<PathBuf> = {
        let mut v = vec![
            PathBuf::from("feedrelay.json"),
            PathBuf::from("../feedrelay.json"),
        ];
        if let Ok(env_path) = std::env::var("FEEDRELAY_CONFIG") {
            v.insert(0, PathBuf::from(env_path));
        }
        v
    };

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RelayConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("feedrelay.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "feedrelay.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return RelayConfig::default();
                }
            },
            Err(_) => continue, // file not found at this path — try next
        }
    }

    RelayConfig::default()
}
