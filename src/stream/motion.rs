//! Motion verification — confirming the media surface is actually updating,
//! not a frozen placeholder.

use std::time::Duration;
use tracing::{info, warn};

use crate::core::types::Frame;
use crate::stream::StreamSurface;

#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Frames sampled before giving up.
    pub samples: u32,
    /// Delay between samples.
    pub cadence: Duration,
    /// A pixel counts as changed when any channel moved by more than this.
    pub channel_delta: u8,
    /// Changed pixels needed to declare motion.
    pub min_changed_pixels: u64,
    /// Fallback threshold for the strided byte-diff over encoded buffers,
    /// used when a frame fails to decode.
    pub byte_diff_threshold: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            samples: 20,
            cadence: Duration::from_millis(400),
            channel_delta: 24,
            min_changed_pixels: 400,
            byte_diff_threshold: 20_000,
        }
    }
}

pub struct MotionVerifier {
    cfg: MotionConfig,
}

impl MotionVerifier {
    pub fn new(cfg: MotionConfig) -> Self {
        Self { cfg }
    }

    /// Sample successive frames and return `true` the first time a consecutive
    /// pair differs by more than the configured magnitude.
    ///
    /// Exhausting the sample budget is fail-open: logs a warning and returns
    /// `false`, and the caller proceeds to streaming anyway — captures may
    /// begin against a static frame rather than block indefinitely.
    pub async fn confirm<S: StreamSurface + ?Sized>(&self, surface: &S) -> bool {
        let clip = surface.media_box().await;
        let mut previous: Option<Frame> = None;

        for i in 0..self.cfg.samples {
            let frame = match surface.capture(clip).await {
                Ok(f) => f,
                Err(e) => {
                    warn!("motion: sample {} capture failed: {}", i, e);
                    tokio::time::sleep(self.cfg.cadence).await;
                    continue;
                }
            };

            if let Some(prev) = previous.take() {
                if frames_differ(&prev, &frame, &self.cfg) {
                    info!("motion: confirmed live after {} samples", i + 1);
                    return true;
                }
            }
            previous = Some(frame);
            tokio::time::sleep(self.cfg.cadence).await;
        }

        warn!(
            "motion: {} samples without confirmed motion — proceeding anyway",
            self.cfg.samples
        );
        false
    }
}

/// Perceptual difference between two frames.
///
/// Primary path decodes both frames and counts pixels whose per-channel delta
/// exceeds the threshold. When either frame fails to decode (or dimensions
/// disagree), falls back to a coarse strided byte-difference over the encoded
/// buffers.
pub fn frames_differ(a: &Frame, b: &Frame, cfg: &MotionConfig) -> bool {
    if let (Ok(da), Ok(db)) = (
        image::load_from_memory(&a.bytes),
        image::load_from_memory(&b.bytes),
    ) {
        let ia = da.to_rgb8();
        let ib = db.to_rgb8();
        if ia.dimensions() == ib.dimensions() {
            let mut changed = 0u64;
            for (pa, pb) in ia.pixels().zip(ib.pixels()) {
                let moved = pa
                    .0
                    .iter()
                    .zip(pb.0.iter())
                    .any(|(&ca, &cb)| ca.abs_diff(cb) > cfg.channel_delta);
                if moved {
                    changed += 1;
                    if changed > cfg.min_changed_pixels {
                        return true;
                    }
                }
            }
            return false;
        }
        // Dimension change (player resize) is itself motion.
        return true;
    }

    coarse_byte_diff(&a.bytes, &b.bytes) > cfg.byte_diff_threshold
}

/// Strided absolute-difference sum over two encoded buffers. Cheap and rough —
/// only a fallback signal.
fn coarse_byte_diff(a: &[u8], b: &[u8]) -> u64 {
    const STRIDE: usize = 16;
    let len = a.len().min(b.len());
    let mut sum = 0u64;
    let mut i = 0;
    while i < len {
        sum += a[i].abs_diff(b[i]) as u64;
        i += STRIDE;
    }
    // Trailing length mismatch counts as difference too.
    sum + (a.len().abs_diff(b.len()) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn jpeg_frame(img: &RgbImage) -> Frame {
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .unwrap();
        let (w, h) = img.dimensions();
        Frame::jpeg(buf, w, h)
    }

    #[test]
    fn identical_frames_never_differ() {
        let img = RgbImage::from_pixel(320, 240, Rgb([120, 60, 200]));
        let f = jpeg_frame(&img);
        let cfg = MotionConfig::default();
        for _ in 0..10 {
            assert!(!frames_differ(&f, &f.clone(), &cfg));
        }
    }

    #[test]
    fn gross_change_is_motion() {
        let a = jpeg_frame(&RgbImage::from_pixel(320, 240, Rgb([10, 10, 10])));
        let b = jpeg_frame(&RgbImage::from_pixel(320, 240, Rgb([240, 240, 240])));
        assert!(frames_differ(&a, &b, &MotionConfig::default()));
    }

    #[test]
    fn subthreshold_noise_is_not_motion() {
        let a = jpeg_frame(&RgbImage::from_pixel(320, 240, Rgb([100, 100, 100])));
        // A handful of changed pixels stays under min_changed_pixels.
        let mut img = RgbImage::from_pixel(320, 240, Rgb([100, 100, 100]));
        for x in 0..5 {
            img.put_pixel(x, 0, Rgb([255, 255, 255]));
        }
        let b = jpeg_frame(&img);
        let cfg = MotionConfig {
            min_changed_pixels: 2000,
            ..MotionConfig::default()
        };
        assert!(!frames_differ(&a, &b, &cfg));
    }

    #[test]
    fn undecodable_frames_fall_back_to_byte_diff() {
        let cfg = MotionConfig::default();
        let a = Frame::jpeg(vec![0u8; 64 * 1024], 0, 0);
        let b = Frame::jpeg(vec![255u8; 64 * 1024], 0, 0);
        assert!(frames_differ(&a, &b, &cfg));

        let same = Frame::jpeg(vec![7u8; 64 * 1024], 0, 0);
        assert!(!frames_differ(&same, &same.clone(), &cfg));
    }
}
