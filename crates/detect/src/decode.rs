use image::ImageFormat;
use tracing::debug;

use crate::error::DetectError;
use crate::model::ModelInput;

/// Decode an uploaded file into model input, dropping any alpha channel.
pub fn decode_image(bytes: &[u8]) -> Result<ModelInput, DetectError> {
    let decoded = image::load_from_memory(bytes)?;
    let source_channels = decoded.color().channel_count();
    let image = decoded.to_rgb8();
    debug!(
        width = image.width(),
        height = image.height(),
        source_channels,
        "image decoded"
    );
    Ok(ModelInput {
        image,
        source_channels,
    })
}

/// File extension for the format the bytes look like, if any.
pub fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    let format = image::guess_format(bytes).ok()?;
    Some(match format {
        ImageFormat::Jpeg => "jpg",
        other => other.extensions_str().first().copied()?,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{Rgba, RgbaImage};

    use super::*;

    fn rgba_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 100, 50, 128]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn alpha_channel_is_dropped() {
        let input = decode_image(&rgba_png(4, 3)).unwrap();
        assert_eq!(input.source_channels, 4);
        assert_eq!(input.shape(), [1, 3, 4, 3]);
        assert_eq!(input.image.as_raw().len(), 4 * 3 * 3);
        assert_eq!(&input.image.as_raw()[..3], &[200, 100, 50]);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, DetectError::Decode(_)));
    }

    #[test]
    fn sniffs_png_and_rejects_text() {
        assert_eq!(sniff_extension(&rgba_png(1, 1)), Some("png"));
        assert_eq!(sniff_extension(b"hello"), None);
    }

    #[test]
    fn png_reencode_round_trips_pixels() {
        let input = decode_image(&rgba_png(3, 3)).unwrap();
        let again = decode_image(&input.to_png().unwrap()).unwrap();
        assert_eq!(again.source_channels, 3);
        assert_eq!(again.image, input.image);
    }
}
