//! ZRLE encoding (RFC 6143 §7.7.6): zlib-compressed tiles with per-tile
//! palette and run-length sub-encodings.
//!
//! The U32-prefixed payload of every ZRLE rectangle extends one zlib stream
//! that lives as long as the session. After inflation the rectangle is a
//! sequence of 64×64 tiles in row-major order, the last column and row
//! clipped to the rectangle. Each tile opens with a subencoding byte: bit 7
//! selects RLE, the low seven bits give the palette size (0 = none,
//! 1 = solid, 2..127 = palette).

use crate::encoding::ByteCursor;
use crate::error::{Error, Result};
use crate::protocol::wire::{read_bytes, PixelFormat};
use crate::screen::Color;
use crate::zlib::Inflator;
use tokio::io::{AsyncRead, AsyncReadExt};

const TILE_SIZE: u16 = 64;

/// Largest plausible compressed segment for one rectangle; anything bigger
/// is a corrupt length field, not pixel data.
const MAX_SEGMENT: usize = 1 << 26;

/// Stateful ZRLE rectangle decoder; owns the session's ZRLE zlib stream.
pub(crate) struct ZrleDecoder {
    inflator: Inflator,
}

impl ZrleDecoder {
    pub(crate) fn new() -> Self {
        Self {
            inflator: Inflator::new(),
        }
    }

    /// Decode one rectangle: U32 length, that many compressed bytes fed to
    /// the stream, then the inflated tile data parsed to exhaustion.
    pub(crate) async fn decode<R>(
        &mut self,
        reader: &mut R,
        width: u16,
        height: u16,
        format: &PixelFormat,
    ) -> Result<Vec<Color>>
    where
        R: AsyncRead + Unpin,
    {
        let length = reader.read_u32().await? as usize;
        if length > MAX_SEGMENT {
            return Err(Error::protocol(format!(
                "implausible ZRLE segment length {length}"
            )));
        }
        let compressed = read_bytes(reader, length).await?;
        let inflated = self.inflator.inflate(&compressed)?;

        if format.bits_per_pixel < 24 {
            return Err(Error::decode(format!(
                "ZRLE requires 3-byte CPIXELs, got {} bits per pixel",
                format.bits_per_pixel
            )));
        }

        let mut cursor = ByteCursor::new(&inflated);
        let colors = parse_rect(&mut cursor, width, height)?;
        if cursor.remaining() != 0 {
            // Anything left over means the tile walk and the server
            // disagreed about geometry.
            return Err(Error::decode(format!(
                "{} unread bytes after ZRLE tile parse",
                cursor.remaining()
            )));
        }
        Ok(colors)
    }
}

/// Parse a full rectangle of tiles from an inflated buffer.
pub(crate) fn parse_rect(cursor: &mut ByteCursor<'_>, width: u16, height: u16) -> Result<Vec<Color>> {
    let mut colors = vec![Color::default(); width as usize * height as usize];

    let mut tile_y = 0;
    while tile_y < height {
        let tile_height = TILE_SIZE.min(height - tile_y);
        let mut tile_x = 0;
        while tile_x < width {
            let tile_width = TILE_SIZE.min(width - tile_x);
            let tile = parse_tile(cursor, tile_width, tile_height)?;

            for row in 0..tile_height as usize {
                let src = row * tile_width as usize;
                let dst = (tile_y as usize + row) * width as usize + tile_x as usize;
                colors[dst..dst + tile_width as usize]
                    .copy_from_slice(&tile[src..src + tile_width as usize]);
            }
            tile_x += tile_width;
        }
        tile_y += tile_height;
    }
    Ok(colors)
}

fn parse_tile(cursor: &mut ByteCursor<'_>, width: u16, height: u16) -> Result<Vec<Color>> {
    let area = width as usize * height as usize;

    let subencoding = cursor.read_u8()?;
    let rle = subencoding & 0x80 != 0;
    let palette_size = (subencoding & 0x7f) as usize;
    let palette = cursor.read_colors(palette_size)?;

    match (rle, palette_size) {
        // Raw: width*height CPIXELs.
        (false, 0) => cursor.read_colors(area),

        // Solid: the palette entry fills the tile.
        (false, 1) => Ok(vec![palette[0]; area]),

        // Packed palette: bit fields, MSB first, rows byte-padded.
        (false, 2..=16) => {
            let bits: u8 = if palette_size > 4 {
                4
            } else if palette_size > 2 {
                2
            } else {
                1
            };

            let mut pixels = Vec::with_capacity(area);
            for _ in 0..height {
                // Leftover bits do not carry across rows.
                let mut byte = 0u8;
                let mut have = 0u8;
                for _ in 0..width {
                    if have == 0 {
                        byte = cursor.read_u8()?;
                        have = 8;
                    }
                    have -= bits;
                    let index = ((byte >> have) & ((1 << bits) - 1)) as usize;
                    pixels.push(palette_entry(&palette, index)?);
                }
            }
            Ok(pixels)
        }

        // 17..127 would mean palette reuse, which plain ZRLE never sends.
        (false, _) => Err(Error::decode(format!(
            "impossible ZRLE subencoding {subencoding} (palette reuse)"
        ))),

        // Plain RLE: (CPIXEL, run length) pairs until the tile is full.
        (true, 0) => {
            let mut pixels = vec![Color::default(); area];
            let mut pos = 0;
            while pos < area {
                let color = cursor.read_color()?;
                let run = read_run_length(cursor)?;
                fill_run(&mut pixels, pos, run, color)?;
                pos += run;
            }
            Ok(pixels)
        }

        // 129 is reserved (palette reuse with RLE).
        (true, 1) => Err(Error::decode(
            "impossible ZRLE subencoding 129 (reserved)".to_string(),
        )),

        // Palette RLE: an index byte per run; the high bit marks a run
        // length suffix, otherwise the run is a single pixel.
        (true, _) => {
            let mut pixels = vec![Color::default(); area];
            let mut pos = 0;
            while pos < area {
                let mut index = cursor.read_u8()?;
                let run = if index & 0x80 != 0 {
                    read_run_length(cursor)?
                } else {
                    1
                };
                index &= 0x7f;
                let color = palette_entry(&palette, index as usize)?;
                fill_run(&mut pixels, pos, run, color)?;
                pos += run;
            }
            Ok(pixels)
        }
    }
}

fn palette_entry(palette: &[Color], index: usize) -> Result<Color> {
    palette.get(index).copied().ok_or_else(|| {
        Error::decode(format!(
            "palette index {index} out of range for palette of {}",
            palette.len()
        ))
    })
}

fn fill_run(pixels: &mut [Color], pos: usize, run: usize, color: Color) -> Result<()> {
    pixels
        .get_mut(pos..pos + run)
        .ok_or_else(|| Error::decode(format!("run of {run} pixels overflows the tile")))?
        .fill(color);
    Ok(())
}

/// Run lengths are 1 plus the sum of the length bytes; any byte other than
/// 255 is the last one.
fn read_run_length(cursor: &mut ByteCursor<'_>) -> Result<usize> {
    let mut length = 1usize;
    loop {
        let byte = cursor.read_u8()?;
        length += byte as usize;
        if byte != 255 {
            return Ok(length);
        }
    }
}
