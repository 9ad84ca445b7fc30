//! Model boundary for face/age/gender detection.
//!
//! The model itself is an external collaborator behind [`Detector`]. This
//! crate owns what sits on either side of it: decoding uploads into
//! [`ModelInput`], and mapping [`RawFace`] output into
//! [`visage_core::DetectionResult`].

pub mod decode;
pub mod error;
pub mod http;
pub mod mapping;
pub mod model;

pub use decode::{decode_image, sniff_extension};
pub use error::DetectError;
pub use http::HttpDetector;
pub use mapping::{map_face, map_faces};
pub use model::{Detector, ModelInput, RawFace};
