//! Rectangle encodings and the buffers their decoders parse from.

pub mod raw;
pub mod tight;
pub mod zrle;

use crate::error::{Error, Result};
use crate::protocol::wire::{read_bytes, PixelFormat};
use crate::screen::Color;
use tokio::io::AsyncRead;

/// Raw pixel data (RFC 6143 §7.7.1). Always accepted.
pub const RAW: i32 = 0;
/// Tight compression (rfbproto extension, type 7).
pub const TIGHT: i32 = 7;
/// Zlib run-length encoding (RFC 6143 §7.7.6).
pub const ZRLE: i32 = 16;
/// Rich-cursor pseudo-encoding; carries a client-side cursor shape.
pub const CURSOR_PSEUDO: i32 = -239;

/// Preference hints sent in SetEncodings. Never decoded; their type id is
/// the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoEncoding {
    /// JPEG quality, 0..9.
    Quality(i32),
    /// zlib compression effort, 0..9.
    Compress(i32),
    /// Fine-grained quality, 0..100.
    FineQuality(i32),
    /// Chroma subsampling, 0..3.
    Subsample(i32),
}

impl PseudoEncoding {
    pub fn id(self) -> i32 {
        match self {
            PseudoEncoding::Quality(level) => -32 + level,
            PseudoEncoding::Compress(level) => -256 + level,
            PseudoEncoding::FineQuality(level) => -512 + level,
            PseudoEncoding::Subsample(level) => -768 + level,
        }
    }
}

/// Read a cursor pseudo-rectangle: the cursor pixels followed by a one-bit
/// transparency mask, retained verbatim for downstream passthrough.
pub(crate) async fn read_cursor<R>(
    reader: &mut R,
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let area = width as usize * height as usize;
    let mask_bytes = (width as usize + 7) / 8 * height as usize;
    let size = area * format.bytes_per_pixel() + mask_bytes;
    Ok(read_bytes(reader, size).await?)
}

/// Cursor over a fully-inflated byte buffer.
///
/// The ZRLE and Tight parsers walk their decompressed payloads through this
/// instead of reinterpreting the buffer as packed structs.
pub(crate) struct ByteCursor<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> ByteCursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.off
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.off)
            .ok_or_else(|| Error::decode("unexpected end of pixel data"))?;
        self.off += 1;
        Ok(byte)
    }

    /// One 3-byte CPIXEL.
    pub(crate) fn read_color(&mut self) -> Result<Color> {
        let bytes = self
            .buf
            .get(self.off..self.off + 3)
            .ok_or_else(|| Error::decode("unexpected end of pixel data"))?;
        self.off += 3;
        Ok(Color::new(bytes[0], bytes[1], bytes[2]))
    }

    /// A run of `n` 3-byte CPIXELs.
    pub(crate) fn read_colors(&mut self, n: usize) -> Result<Vec<Color>> {
        let len = n * 3;
        let bytes = self
            .buf
            .get(self.off..self.off + len)
            .ok_or_else(|| Error::decode("unexpected end of pixel data"))?;
        self.off += len;
        Ok(colors_from_cpixels(bytes))
    }
}

/// Unpack a buffer of 3-byte CPIXELs into colors.
pub(crate) fn colors_from_cpixels(bytes: &[u8]) -> Vec<Color> {
    bytes
        .chunks_exact(3)
        .map(|c| Color::new(c[0], c[1], c[2]))
        .collect()
}
