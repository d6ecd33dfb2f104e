//! Big-endian scalar I/O and the RFB pixel format block.
//!
//! All multi-byte RFB integers are big-endian; the tokio `read_u16`/
//! `read_u32`/`read_i32` helpers already are, so this module only adds the
//! byte-array reader and the 16-byte pixel format codec (RFC 6143 §7.4).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read exactly `n` bytes. A short read surfaces as `UnexpectedEof`.
pub(crate) async fn read_bytes<R>(reader: &mut R, n: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Server pixel format (RFC 6143 §7.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_color: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The only format the session engine negotiates: 32-bit little-endian
    /// true color with 8-bit channels at the given byte-aligned shifts.
    pub fn rgb888(red_shift: u8, green_shift: u8, blue_shift: u8) -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_color: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift,
            green_shift,
            blue_shift,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bits_per_pixel as usize / 8
    }

    /// Whether this is the 32/24 true-color format with 8-bit channels that
    /// the CPIXEL-based decoders require.
    pub(crate) fn is_rgb888(&self) -> bool {
        self.bits_per_pixel == 32
            && self.depth == 24
            && self.true_color
            && self.red_max == 255
            && self.green_max == 255
            && self.blue_max == 255
    }

    /// Parse the 16-byte wire form; the last three bytes are padding.
    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        Self {
            bits_per_pixel: bytes[0],
            depth: bytes[1],
            big_endian: bytes[2] != 0,
            true_color: bytes[3] != 0,
            red_max: u16::from_be_bytes([bytes[4], bytes[5]]),
            green_max: u16::from_be_bytes([bytes[6], bytes[7]]),
            blue_max: u16::from_be_bytes([bytes[8], bytes[9]]),
            red_shift: bytes[10],
            green_shift: bytes[11],
            blue_shift: bytes[12],
        }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0] = self.bits_per_pixel;
        bytes[1] = self.depth;
        bytes[2] = self.big_endian as u8;
        bytes[3] = self.true_color as u8;
        bytes[4..6].copy_from_slice(&self.red_max.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.green_max.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.blue_max.to_be_bytes());
        bytes[10] = self.red_shift;
        bytes[11] = self.green_shift;
        bytes[12] = self.blue_shift;
        bytes
    }
}
