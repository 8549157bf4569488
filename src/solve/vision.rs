//! Strategy 3: delegated vision classification.
//!
//! Serializes the frame to base64 and asks an OpenAI-compatible multimodal
//! endpoint to locate the challenge widget. The response parser is
//! deliberately tolerant: models wrap the verdict in varying envelope shapes
//! and frequently decorate the JSON with prose or code fences. Anything
//! unparsable is a soft "no suggestion" — never an error that aborts the
//! session.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use tracing::debug;

use crate::core::config::VisionConfig;
use crate::core::types::{ActionSuggestion, Frame, Target};
use crate::solve::detector::DetectStrategy;
use crate::solve::ChallengePage;

const VISION_PROMPT: &str = "You are looking at a screenshot of a web page that may show a \
bot-verification interstitial in front of a live video. Locate the verification checkbox \
and/or the join button, if present. Respond with EXACTLY one JSON object and nothing else, \
in this shape: {\"checkbox\": {\"x\": 0, \"y\": 0, \"w\": 0, \"h\": 0, \"confidence\": 0.0} \
or null, \"join_button\": {same shape} or null, \"action\": one of \"click_checkbox\", \
\"click_join\", \"wait\", \"none\"}. Coordinates are the CENTER of the element in page pixels.";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct VisionBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct VisionVerdict {
    #[serde(default)]
    pub checkbox: Option<VisionBox>,
    #[serde(default)]
    pub join_button: Option<VisionBox>,
    #[serde(default)]
    pub action: Option<String>,
}

pub struct VisionStrategy {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    confidence_floor: f64,
}

impl VisionStrategy {
    /// Returns `None` when no API credential resolves — the strategy is simply
    /// unavailable; the caller logs it and the other strategies still run.
    pub fn from_config(
        cfg: &VisionConfig,
        http_client: reqwest::Client,
        confidence_floor: f64,
    ) -> Option<Self> {
        let api_key = cfg.resolve_api_key()?;
        Some(Self {
            http_client,
            base_url: cfg.resolve_base_url(),
            api_key,
            model: cfg.resolve_model(),
            confidence_floor,
        })
    }

    async fn classify(&self, frame: &Frame) -> Result<serde_json::Value> {
        let b64 = BASE64.encode(&frame.bytes);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "max_tokens": 300,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": VISION_PROMPT},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:image/jpeg;base64,{}", b64)
                    }}
                ]
            }]
        });

        let builder = self.http_client.post(url).json(&body);
        // Key-less local endpoints work without the Authorization header.
        let builder = if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(self.api_key.trim())
        };

        let response = builder.send().await.context("vision request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("vision endpoint returned {}: {}", status, text));
        }
        response.json().await.context("vision response body was not JSON")
    }
}

#[async_trait]
impl DetectStrategy for VisionStrategy {
    fn name(&self) -> &'static str {
        "vision"
    }

    async fn detect(&self, frame: &Frame, _page: &dyn ChallengePage) -> Result<ActionSuggestion> {
        let envelope = self.classify(frame).await?;
        let Some(verdict) = tolerant_decode(&envelope) else {
            debug!("vision: no verdict found in response envelope");
            return Ok(ActionSuggestion::none());
        };
        Ok(suggestion_from_verdict(&verdict, self.confidence_floor))
    }
}

/// Map a verdict onto a suggestion, honoring the confidence floor.
pub fn suggestion_from_verdict(verdict: &VisionVerdict, floor: f64) -> ActionSuggestion {
    let (label, boxed) = match verdict.action.as_deref() {
        Some("click_checkbox") => ("checkbox", verdict.checkbox.as_ref()),
        Some("click_join") => ("join_button", verdict.join_button.as_ref()),
        Some("wait") => return ActionSuggestion::wait(0.0),
        _ => return ActionSuggestion::none(),
    };

    let Some(b) = boxed else {
        // Action names a box the model didn't supply — treat as a pacing hint.
        return ActionSuggestion::wait(0.0);
    };
    if b.confidence < floor {
        return ActionSuggestion::wait(b.confidence);
    }
    ActionSuggestion::click(
        label,
        Target {
            center_x: b.x,
            center_y: b.y,
            width: b.w,
            height: b.h,
        },
        b.confidence,
    )
}

// ---------------------------------------------------------------------------
// Tolerant decode
// ---------------------------------------------------------------------------

/// Extract a `VisionVerdict` from whatever envelope the endpoint produced.
///
/// Contract, in order:
/// 1. If the envelope itself already looks like a verdict, take it directly.
/// 2. Walk the known envelope paths (OpenAI chat, Ollama, Gemini, bare text
///    fields) for candidate text.
/// 3. In each candidate, take the first brace-balanced `{...}` block and
///    strict-parse it; on failure, retry after naive single→double quote
///    normalization.
/// 4. Anything else fails soft: `None`.
pub fn tolerant_decode(envelope: &serde_json::Value) -> Option<VisionVerdict> {
    if looks_like_verdict(envelope) {
        if let Ok(v) = serde_json::from_value::<VisionVerdict>(envelope.clone()) {
            return Some(v);
        }
    }

    for text in candidate_texts(envelope) {
        if let Some(v) = parse_embedded_verdict(&text) {
            return Some(v);
        }
    }
    None
}

fn looks_like_verdict(v: &serde_json::Value) -> bool {
    v.get("action").is_some() || v.get("checkbox").is_some() || v.get("join_button").is_some()
}

/// Likely locations of the model's text output across response envelopes.
fn candidate_texts(envelope: &serde_json::Value) -> Vec<String> {
    let paths: &[&[&str]] = &[
        &["choices", "0", "message", "content"],
        &["choices", "0", "text"],
        &["message", "content"],
        &["candidates", "0", "content", "parts", "0", "text"],
        &["output_text"],
        &["response"],
        &["content", "0", "text"],
        &["text"],
    ];

    let mut out = Vec::new();
    for path in paths {
        if let Some(s) = string_at_path(envelope, path) {
            out.push(s);
        }
    }
    // Last resort: scan the serialized envelope itself.
    out.push(envelope.to_string());
    out
}

fn string_at_path(value: &serde_json::Value, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for seg in path {
        cur = match seg.parse::<usize>() {
            Ok(idx) => cur.get(idx)?,
            Err(_) => cur.get(seg)?,
        };
    }
    match cur {
        serde_json::Value::String(s) => Some(s.clone()),
        // Some providers return content as an array of typed parts.
        serde_json::Value::Array(parts) => {
            let joined: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("");
            (!joined.is_empty()).then_some(joined)
        }
        _ => None,
    }
}

fn parse_embedded_verdict(text: &str) -> Option<VisionVerdict> {
    let block = first_brace_block(text)?;
    if let Ok(v) = serde_json::from_str::<VisionVerdict>(block) {
        if v.action.is_some() || v.checkbox.is_some() || v.join_button.is_some() {
            return Some(v);
        }
        return None;
    }
    // Naive repair: models sometimes emit single-quoted pseudo-JSON.
    let repaired = quote_repair(block);
    match serde_json::from_str::<VisionVerdict>(&repaired) {
        Ok(v) if v.action.is_some() || v.checkbox.is_some() || v.join_button.is_some() => Some(v),
        _ => None,
    }
}

/// First brace-balanced `{...}` block, string-literal aware.
pub fn first_brace_block(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn quote_repair(block: &str) -> String {
    static SINGLE_QUOTED: OnceLock<Regex> = OnceLock::new();
    let re = SINGLE_QUOTED.get_or_init(|| Regex::new(r"'([^']*)'").expect("valid regex"));
    re.replace_all(block, "\"$1\"").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SuggestionKind;

    fn openai_envelope(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
    }

    #[test]
    fn decodes_bare_verdict() {
        let v = serde_json::json!({
            "action": "click_join",
            "join_button": {"x": 540, "y": 1200, "w": 80, "h": 40, "confidence": 0.9},
            "checkbox": null
        });
        let verdict = tolerant_decode(&v).unwrap();
        assert_eq!(verdict.action.as_deref(), Some("click_join"));
    }

    #[test]
    fn decodes_openai_envelope_with_prose() {
        let env = openai_envelope(
            "Sure! Here is the analysis:\n```json\n{\"checkbox\": null, \
             \"join_button\": {\"x\": 540, \"y\": 1200, \"w\": 80, \"h\": 40, \
             \"confidence\": 0.9}, \"action\": \"click_join\"}\n```",
        );
        let verdict = tolerant_decode(&env).unwrap();
        let sugg = suggestion_from_verdict(&verdict, 0.5);
        assert!(matches!(sugg.kind, SuggestionKind::ClickTarget(ref l) if l == "join_button"));
        let t = sugg.target.unwrap();
        assert_eq!(t.center_x, 540.0);
        assert_eq!(t.center_y, 1200.0);
    }

    #[test]
    fn decodes_gemini_style_envelope() {
        let env = serde_json::json!({
            "candidates": [{"content": {"parts": [{
                "text": "{\"checkbox\": {\"x\": 100, \"y\": 200, \"w\": 20, \"h\": 20, \
                         \"confidence\": 0.8}, \"join_button\": null, \"action\": \"click_checkbox\"}"
            }]}}]
        });
        let verdict = tolerant_decode(&env).unwrap();
        assert!(verdict.checkbox.is_some());
    }

    #[test]
    fn quote_repair_recovers_single_quoted_json() {
        let env = openai_envelope(
            "{'checkbox': null, 'join_button': null, 'action': 'wait'}",
        );
        let verdict = tolerant_decode(&env).unwrap();
        assert_eq!(verdict.action.as_deref(), Some("wait"));
    }

    #[test]
    fn unparsable_is_soft_none() {
        assert!(tolerant_decode(&openai_envelope("no json here at all")).is_none());
        assert!(tolerant_decode(&serde_json::json!({"unrelated": true})).is_none());
    }

    #[test]
    fn brace_block_skips_braces_inside_strings() {
        let text = r#"prefix {"a": "brace } inside", "action": "none"} suffix"#;
        let block = first_brace_block(text).unwrap();
        assert!(block.ends_with("\"none\"}"));
        assert!(serde_json::from_str::<serde_json::Value>(block).is_ok());
    }

    #[test]
    fn low_confidence_yields_wait() {
        let verdict = VisionVerdict {
            checkbox: Some(VisionBox { x: 1.0, y: 2.0, w: 3.0, h: 4.0, confidence: 0.2 }),
            join_button: None,
            action: Some("click_checkbox".into()),
        };
        let sugg = suggestion_from_verdict(&verdict, 0.5);
        assert_eq!(sugg.kind, SuggestionKind::Wait);
    }

    #[test]
    fn missing_box_for_action_yields_wait() {
        let verdict = VisionVerdict {
            checkbox: None,
            join_button: None,
            action: Some("click_join".into()),
        };
        assert_eq!(suggestion_from_verdict(&verdict, 0.5).kind, SuggestionKind::Wait);
    }
}
