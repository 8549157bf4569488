//! Strategy 2: sliding-window template match against a reference icon bitmap.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::RgbImage;
use std::path::Path;
use tracing::info;

use crate::core::types::{ActionSuggestion, Frame, Rect, Target};
use crate::solve::detector::DetectStrategy;
use crate::solve::ChallengePage;

/// Window positions advance by this many pixels per step. Scanning every 4th
/// row/column trades a little placement accuracy for a ~16× speedup, which is
/// plenty for a checkbox-sized icon.
const SLIDE_STRIDE: u32 = 4;
/// Pixels sampled inside each window, per axis.
const SAMPLE_STRIDE: u32 = 2;

pub struct TemplateStrategy {
    icon: RgbImage,
    tolerance: f64,
    confidence_floor: f64,
}

impl TemplateStrategy {
    pub fn load(path: &Path, tolerance: f64, confidence_floor: f64) -> Result<Self> {
        let icon = image::open(path)
            .with_context(|| format!("failed to load reference icon {}", path.display()))?
            .to_rgb8();
        if icon.width() == 0 || icon.height() == 0 {
            return Err(anyhow!("reference icon {} is empty", path.display()));
        }
        info!(
            "template strategy: icon {}×{} loaded from {}",
            icon.width(),
            icon.height(),
            path.display()
        );
        Ok(Self {
            icon,
            tolerance,
            confidence_floor,
        })
    }
}

/// Slide `icon` over `frame`, scoring each window by mean squared per-channel
/// difference over a sparse pixel sample. Returns the first window whose score
/// is below `tolerance`, with its score.
pub fn match_icon(frame: &RgbImage, icon: &RgbImage, tolerance: f64) -> Option<(Rect, f64)> {
    let (fw, fh) = frame.dimensions();
    let (iw, ih) = icon.dimensions();
    if iw > fw || ih > fh {
        return None;
    }

    let mut y = 0;
    while y + ih <= fh {
        let mut x = 0;
        while x + iw <= fw {
            let mse = window_mse(frame, icon, x, y);
            if mse < tolerance {
                return Some((
                    Rect {
                        x,
                        y,
                        width: iw,
                        height: ih,
                    },
                    mse,
                ));
            }
            x += SLIDE_STRIDE;
        }
        y += SLIDE_STRIDE;
    }
    None
}

fn window_mse(frame: &RgbImage, icon: &RgbImage, ox: u32, oy: u32) -> f64 {
    let (iw, ih) = icon.dimensions();
    let mut sum = 0.0f64;
    let mut samples = 0u64;

    let mut y = 0;
    while y < ih {
        let mut x = 0;
        while x < iw {
            let a = frame.get_pixel(ox + x, oy + y);
            let b = icon.get_pixel(x, y);
            for c in 0..3 {
                let d = a.0[c] as f64 - b.0[c] as f64;
                sum += d * d;
            }
            samples += 3;
            x += SAMPLE_STRIDE;
        }
        y += SAMPLE_STRIDE;
    }

    if samples == 0 {
        return f64::MAX;
    }
    sum / samples as f64
}

#[async_trait]
impl DetectStrategy for TemplateStrategy {
    fn name(&self) -> &'static str {
        "template_match"
    }

    async fn detect(&self, frame: &Frame, _page: &dyn ChallengePage) -> Result<ActionSuggestion> {
        let bytes = frame.bytes.clone();
        let icon = self.icon.clone();
        let tolerance = self.tolerance;

        // Pixel scan is CPU-bound; keep it off the session task.
        let hit = tokio::task::spawn_blocking(move || {
            let decoded = image::load_from_memory(&bytes)
                .map_err(|e| anyhow!("frame decode failed: {}", e))?
                .to_rgb8();
            Ok::<_, anyhow::Error>(match_icon(&decoded, &icon, tolerance))
        })
        .await
        .map_err(|e| anyhow!("template match worker join failed: {}", e))??;

        let Some((rect, mse)) = hit else {
            return Ok(ActionSuggestion::none());
        };

        let confidence = (1.0 - mse / self.tolerance).clamp(0.0, 1.0);
        if confidence < self.confidence_floor {
            return Ok(ActionSuggestion::wait(confidence));
        }
        Ok(ActionSuggestion::click(
            "template_icon",
            Target::from_rect(rect),
            confidence,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn checker_icon(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([20, 20, 20])
            } else {
                Rgb([235, 235, 235])
            }
        })
    }

    #[test]
    fn finds_icon_pasted_into_synthetic_frame() {
        let icon = checker_icon(32, 32);
        let mut frame = RgbImage::from_pixel(800, 600, Rgb([90, 140, 90]));
        image::imageops::overlay(&mut frame, &icon, 200, 300);

        let (rect, mse) = match_icon(&frame, &icon, 100.0).expect("icon should be found");
        assert!(mse < 100.0);

        let (cx, cy) = rect.center();
        let expected_cx = 200.0 + 16.0;
        let expected_cy = 300.0 + 16.0;
        // Stride means the window may land a few pixels off the exact spot.
        assert!((cx - expected_cx).abs() <= 4.0, "cx={} expected≈{}", cx, expected_cx);
        assert!((cy - expected_cy).abs() <= 4.0, "cy={} expected≈{}", cy, expected_cy);
    }

    #[test]
    fn no_match_on_plain_frame() {
        let icon = checker_icon(32, 32);
        let frame = RgbImage::from_pixel(800, 600, Rgb([90, 140, 90]));
        assert!(match_icon(&frame, &icon, 100.0).is_none());
    }

    #[test]
    fn icon_larger_than_frame_is_no_match() {
        let icon = checker_icon(64, 64);
        let frame = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
        assert!(match_icon(&frame, &icon, 1e9).is_none());
    }
}
