//! JPEG decoding seam.
//!
//! Tight's JpegCompression sub-encoding carries a JFIF stream. Decoding it
//! is the embedder's concern; the driver core only needs `bytes -> packed
//! RGB`. Install a decoder at session open when negotiating quality levels
//! that let the server pick JPEG.

/// Decodes a JFIF stream into packed 8-bit RGB, row-major, three bytes per
/// pixel.
pub trait JpegDecoder: Send + Sync {
    fn decode_rgb(&self, data: &[u8]) -> Result<Vec<u8>, String>;
}

/// Default decoder: rejects every JPEG rectangle.
#[derive(Debug, Default)]
pub struct NoJpeg;

impl JpegDecoder for NoJpeg {
    fn decode_rgb(&self, _data: &[u8]) -> Result<Vec<u8>, String> {
        Err("no JPEG decoder installed".to_string())
    }
}
