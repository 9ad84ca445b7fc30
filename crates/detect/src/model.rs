use std::io::Cursor;

use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::DetectError;

/// Decoded image in the layout detection models take: 8-bit RGB, row-major.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub image: RgbImage,
    /// Channel count of the source before reduction to RGB.
    pub source_channels: u8,
}

impl ModelInput {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Batched NHWC tensor shape `[1, height, width, 3]`.
    pub fn shape(&self) -> [usize; 4] {
        [1, self.height() as usize, self.width() as usize, 3]
    }

    /// Lossless re-encode for transports that want a file, not a tensor.
    pub fn to_png(&self) -> Result<Vec<u8>, DetectError> {
        let mut buf = Cursor::new(Vec::new());
        self.image.write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    }
}

/// One face as reported by the model, before mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFace {
    pub age: Option<f64>,
    /// Predicted label, `"male"` or `"female"`.
    pub gender: Option<String>,
    /// Score of the predicted label.
    pub gender_score: Option<f64>,
}

/// Face/age/gender model.
///
/// `load` runs once before traffic is accepted; `detect` is called once per
/// processing attempt and may run concurrently.
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    /// Load and warm up the model.
    async fn load(&self) -> Result<(), DetectError>;

    async fn detect(&self, input: &ModelInput) -> Result<Vec<RawFace>, DetectError>;
}
