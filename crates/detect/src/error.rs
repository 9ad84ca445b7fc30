use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model API error: {status} {body}")]
    Api { status: u16, body: String },

    #[error("failed to parse model response: {0}")]
    Parse(String),

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("model not loaded: {0}")]
    NotLoaded(String),

    #[error("{0}")]
    Model(String),
}

impl From<image::ImageError> for DetectError {
    fn from(e: image::ImageError) -> Self {
        DetectError::Decode(e.to_string())
    }
}
