//! `Uploader` — fire-and-forget multipart frame delivery.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::types::{Frame, UploadRecord};
use crate::stream::FrameSink;

/// Timestamp-derived filename, shared by the uploader and the local debug copy.
pub fn frame_filename(captured_at: DateTime<Utc>) -> String {
    format!("frame-{}.jpg", captured_at.timestamp_millis())
}

pub struct Uploader {
    http_client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl Uploader {
    pub fn new(http_client: reqwest::Client, endpoint: String, timeout: Duration) -> Self {
        Self {
            http_client,
            endpoint,
            timeout,
        }
    }

    /// Build the multipart POST for one frame: a single binary part named
    /// `file`, content-type `image/jpeg`. A 0-byte frame still produces a
    /// well-formed request — short-circuiting here would hide capture bugs.
    pub fn build_request(&self, frame: Frame) -> Result<reqwest::Request> {
        let filename = frame_filename(frame.captured_at);
        let part = Part::bytes(frame.bytes)
            .file_name(filename)
            .mime_str("image/jpeg")
            .map_err(|e| anyhow!("invalid part mime: {}", e))?;
        let form = Form::new().part("file", part);

        self.http_client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .multipart(form)
            .build()
            .map_err(|e| anyhow!("failed to build upload request: {}", e))
    }

    async fn post_frame(&self, frame: Frame) -> Result<u16> {
        let request = self.build_request(frame)?;
        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| anyhow!("upload transport error: {}", e))?;
        Ok(response.status().as_u16())
    }
}

#[async_trait]
impl FrameSink for Uploader {
    /// Deliver one frame. All failures are logged and discarded — the next
    /// scheduled capture supersedes this frame, so there is no retry and no
    /// feedback into the scheduler.
    async fn deliver(&self, frame: Frame) {
        let filename = frame_filename(frame.captured_at);
        let size_bytes = frame.bytes.len();
        let started = Instant::now();

        let outcome = match self.post_frame(frame).await {
            Ok(status) if (200..300).contains(&status) => Ok(status),
            Ok(status) => Err(format!("http status {}", status)),
            Err(e) => Err(e.to_string()),
        };

        let record = UploadRecord {
            filename,
            size_bytes,
            outcome,
            latency_ms: started.elapsed().as_millis() as u64,
        };

        match &record.outcome {
            Ok(status) => info!(
                "upload: {} ({} bytes) → {} in {}ms",
                record.filename, record.size_bytes, status, record.latency_ms
            ),
            Err(e) => warn!(
                "upload: {} ({} bytes) failed after {}ms — discarding: {}",
                record.filename, record.size_bytes, record.latency_ms, e
            ),
        }
    }
}
