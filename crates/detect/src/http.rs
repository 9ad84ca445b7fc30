use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use serde::Deserialize;
use tracing::{debug, info};

use visage_core::config::DetectorConfig;

use crate::error::DetectError;
use crate::model::{Detector, ModelInput, RawFace};

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<RawFace>,
}

/// Client for an inference sidecar that hosts the face model.
///
/// `GET {url}/health` must answer 200 once the model is resident;
/// `POST {url}/detect` takes a PNG body and returns `{"faces": [...]}`.
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
    max_detected: u32,
    min_confidence: f32,
    loaded: AtomicBool,
}

impl HttpDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self, DetectError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            max_detected: config.max_detected,
            min_confidence: config.min_confidence,
            loaded: AtomicBool::new(false),
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    async fn post_detect(&self, png: Vec<u8>) -> Result<Vec<RawFace>, DetectError> {
        let url = format!("{}/detect", self.url);
        debug!(url = %url, bytes = png.len(), "detector request");

        let response = self
            .client
            .post(&url)
            .query(&[
                ("max_detected", self.max_detected.to_string()),
                ("min_confidence", self.min_confidence.to_string()),
            ])
            .header("Content-Type", "image/png")
            .body(png)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectError::Api { status, body });
        }

        let body = response.text().await?;
        let parsed: DetectResponse =
            serde_json::from_str(&body).map_err(|e| DetectError::Parse(e.to_string()))?;
        Ok(parsed.faces)
    }
}

/// PNG encoding is CPU-bound, so it runs on the blocking pool.
async fn encode_png(input: ModelInput) -> Result<Vec<u8>, DetectError> {
    tokio::task::spawn_blocking(move || input.to_png())
        .await
        .map_err(|e| DetectError::Model(format!("png encode task failed: {e}")))?
}

#[async_trait]
impl Detector for HttpDetector {
    fn name(&self) -> &str {
        "http"
    }

    async fn load(&self) -> Result<(), DetectError> {
        let url = format!("{}/health", self.url);
        let response = self.client.get(&url).send().await?;
        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectError::Api { status, body });
        }

        // One throwaway inference so the first real request is not the slow one.
        let blank = ModelInput {
            image: RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])),
            source_channels: 3,
        };
        self.post_detect(encode_png(blank).await?).await?;

        self.loaded.store(true, Ordering::Release);
        info!(url = %self.url, "detector loaded");
        Ok(())
    }

    async fn detect(&self, input: &ModelInput) -> Result<Vec<RawFace>, DetectError> {
        if !self.is_loaded() {
            return Err(DetectError::NotLoaded(self.url.clone()));
        }
        debug!(shape = ?input.shape(), "encoding detector input");
        let faces = self.post_detect(encode_png(input.clone()).await?).await?;
        debug!(faces = faces.len(), "detector response");
        Ok(faces)
    }
}
