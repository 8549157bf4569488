//! Multi-strategy challenge detection.
//!
//! Strategies are tried in a fixed priority order per solve tick; the first
//! non-`None` suggestion wins. A strategy error is absorbed as `None` so the
//! next strategy still runs — no detector opinion may abort the session.

use aho_corasick::AhoCorasick;
use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::core::config::RelayConfig;
use crate::core::types::{ActionSuggestion, Frame, Rect, Target};
use crate::solve::ChallengePage;

#[async_trait]
pub trait DetectStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn detect(&self, frame: &Frame, page: &dyn ChallengePage) -> Result<ActionSuggestion>;
}

pub struct ChallengeDetector {
    strategies: Vec<Box<dyn DetectStrategy>>,
}

impl ChallengeDetector {
    pub fn new(strategies: Vec<Box<dyn DetectStrategy>>) -> Self {
        Self { strategies }
    }

    /// Assemble the strategy chain: text search, then template match, then
    /// delegated vision. Template and vision are optional — each is skipped
    /// (with a log line) when its configuration is absent.
    pub fn from_config(cfg: &RelayConfig, http_client: reqwest::Client) -> Self {
        let floor = cfg.resolve_confidence_floor();
        let mut strategies: Vec<Box<dyn DetectStrategy>> = vec![Box::new(
            TextAnchorStrategy::new(cfg.resolve_marker_phrases(), floor),
        )];

        if let Some(path) = cfg.resolve_template_icon_path() {
            match crate::solve::template::TemplateStrategy::load(
                &path,
                cfg.resolve_template_tolerance(),
                floor,
            ) {
                Ok(s) => strategies.push(Box::new(s)),
                Err(e) => warn!("template strategy disabled ({}): {}", path.display(), e),
            }
        } else {
            debug!("template strategy disabled: no reference icon configured");
        }

        match crate::solve::vision::VisionStrategy::from_config(&cfg.vision, http_client, floor) {
            Some(s) => strategies.push(Box::new(s)),
            None => warn!("vision strategy disabled: no API credential configured"),
        }

        Self { strategies }
    }

    /// Run the strategy chain over one frame. Returns at most one suggestion.
    pub async fn detect(&self, frame: &Frame, page: &dyn ChallengePage) -> ActionSuggestion {
        for strategy in &self.strategies {
            match strategy.detect(frame, page).await {
                Ok(suggestion) if !suggestion.is_none() => {
                    info!(
                        "detector: {} → {:?} (confidence {:.2})",
                        strategy.name(),
                        suggestion.kind,
                        suggestion.confidence
                    );
                    return suggestion;
                }
                Ok(_) => continue,
                Err(e) => {
                    // Strategy errors fall through to the next strategy.
                    warn!("detector: {} errored (treated as none): {}", strategy.name(), e);
                    continue;
                }
            }
        }
        ActionSuggestion::none()
    }
}

// ---------------------------------------------------------------------------
// Strategy 1: text-anchored DOM search
// ---------------------------------------------------------------------------

/// Scans rendered text for configured marker phrases, then asks the DOM for
/// the matched node's box, preferring a nested interactive control.
pub struct TextAnchorStrategy {
    phrases: Vec<String>,
    matcher: AhoCorasick,
    confidence_floor: f64,
}

impl TextAnchorStrategy {
    pub fn new(phrases: Vec<String>, confidence_floor: f64) -> Self {
        let matcher = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(&phrases)
            .expect("valid marker phrases");
        Self {
            phrases,
            matcher,
            confidence_floor,
        }
    }

    fn marker_rect_js(&self) -> String {
        let phrases_json =
            serde_json::to_string(&self.phrases).unwrap_or_else(|_| "[]".to_string());
        format!(
            r#"((phrases) => {{
    const lower = phrases.map(p => p.toLowerCase());
    const visible = (el) => {{
        const s = window.getComputedStyle(el);
        if (!s || s.display === 'none' || s.visibility === 'hidden' || s.opacity === '0') return false;
        const r = el.getBoundingClientRect();
        return !!r && r.width >= 2 && r.height >= 2;
    }};
    let best = null;
    for (const el of document.querySelectorAll('body *')) {{
        const text = (el.textContent || '').toLowerCase();
        if (!text || !lower.some(p => text.includes(p))) continue;
        if (!visible(el)) continue;
        // Deepest matching node wins.
        if (!best || best.contains(el)) best = el;
    }}
    if (!best) return null;
    const control = best.querySelector('input[type="checkbox"], [role="checkbox"], label, button');
    const useControl = !!(control && visible(control));
    const r = (useControl ? control : best).getBoundingClientRect();
    return {{ x: r.x, y: r.y, w: r.width, h: r.height, control: useControl }};
}})({phrases_json})"#
        )
    }
}

#[async_trait]
impl DetectStrategy for TextAnchorStrategy {
    fn name(&self) -> &'static str {
        "text_anchor"
    }

    async fn detect(&self, _frame: &Frame, page: &dyn ChallengePage) -> Result<ActionSuggestion> {
        // Cheap substring scan of the HTML first; the DOM rect query only runs
        // when a marker phrase is actually present.
        let html = page.rendered_html().await?;
        if !self.matcher.is_match(&html) {
            return Ok(ActionSuggestion::none());
        }

        let value = page.eval_json(&self.marker_rect_js()).await?;
        if value.is_null() {
            // Phrase present in markup but not in any visible node.
            return Ok(ActionSuggestion::none());
        }

        let x = value.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let y = value.get("y").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let w = value.get("w").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let h = value.get("h").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let has_control = value.get("control").and_then(|v| v.as_bool()).unwrap_or(false);
        let rect = Rect::clamped(x, y, w, h);

        let (target, label, confidence) = if has_control {
            (Target::from_rect(rect), "checkbox", 0.9)
        } else {
            // Verification widgets conventionally place the actionable control
            // at the left of the label text.
            let (_, cy) = rect.center();
            let cx = rect.x as f64 + (rect.width as f64 * 0.1).clamp(12.0, 40.0);
            (
                Target {
                    center_x: cx,
                    center_y: cy,
                    width: rect.width as f64,
                    height: rect.height as f64,
                },
                "marker_text",
                0.6,
            )
        };

        if confidence < self.confidence_floor {
            return Ok(ActionSuggestion::wait(confidence));
        }
        Ok(ActionSuggestion::click(label, target, confidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matcher_is_case_insensitive() {
        let s = TextAnchorStrategy::new(vec!["verify you are human".into()], 0.5);
        assert!(s.matcher.is_match("<div>Verify You Are Human</div>"));
        assert!(!s.matcher.is_match("<div>nothing here</div>"));
    }

    #[test]
    fn rect_js_embeds_phrases() {
        let s = TextAnchorStrategy::new(vec!["join now".into()], 0.5);
        assert!(s.marker_rect_js().contains("join now"));
    }
}
