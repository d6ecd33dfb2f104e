//! Tight encoding (rfbproto extension, type 7).
//!
//! Every rectangle opens with a compression-control byte. Its low four bits
//! are a reset mask over the session's four zlib streams; bit 7 selects
//! between BasicCompression (filtered pixels through one of the streams)
//! and the Fill / JPEG alternatives. Filtered payloads shorter than twelve
//! bytes skip zlib entirely; longer ones are framed by a compact 1-3 byte
//! length. Streams are long-lived: a rectangle may inflate into data whose
//! back-references reach through every earlier rectangle on that stream.

use crate::encoding::colors_from_cpixels;
use crate::error::{Error, Result};
use crate::jpeg::JpegDecoder;
use crate::protocol::wire::{read_bytes, PixelFormat};
use crate::screen::Color;
use crate::zlib::Inflator;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Rectangles wider than this must be split by the server.
const MAX_WIDTH: u16 = 2048;
/// Post-filter payloads below this many bytes are sent uncompressed.
const ZLIB_MIN: usize = 12;

const FILTER_COPY: u8 = 0;
const FILTER_PALETTE: u8 = 1;
const FILTER_GRADIENT: u8 = 2;

/// One of the four session zlib streams, with the inflated bytes the
/// previous rectangle did not consume.
struct TightStream {
    inflator: Inflator,
    pending: Vec<u8>,
}

impl TightStream {
    fn new() -> Self {
        Self {
            inflator: Inflator::new(),
            pending: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.inflator.reset();
        self.pending.clear();
    }
}

/// Stateful Tight rectangle decoder; owns the session's four zlib streams.
pub(crate) struct TightDecoder {
    streams: [TightStream; 4],
    /// Streams flagged for reset before their next use. Bits accumulate
    /// across rectangles; a Fill or JPEG rectangle leaves them set.
    reset_mask: u8,
}

impl TightDecoder {
    pub(crate) fn new() -> Self {
        Self {
            streams: [
                TightStream::new(),
                TightStream::new(),
                TightStream::new(),
                TightStream::new(),
            ],
            reset_mask: 0,
        }
    }

    pub(crate) async fn decode<R>(
        &mut self,
        reader: &mut R,
        width: u16,
        height: u16,
        format: &PixelFormat,
        jpeg: &dyn JpegDecoder,
    ) -> Result<Vec<Color>>
    where
        R: AsyncRead + Unpin,
    {
        if width > MAX_WIDTH {
            return Err(Error::protocol(format!(
                "Tight rectangle {width}px wide; rectangles wider than {MAX_WIDTH}px must be split"
            )));
        }
        if !format.is_rgb888() {
            return Err(Error::Config(format!(
                "Tight decoding requires 32-bit true color with 8-bit channels, got {format:?}"
            )));
        }

        let area = width as usize * height as usize;
        let control = reader.read_u8().await?;
        self.reset_mask |= control & 0x0f;

        if control >> 7 == 0 {
            let stream = ((control >> 4) & 0x03) as usize;
            let filter = if control & 0x40 != 0 {
                reader.read_u8().await?
            } else {
                FILTER_COPY
            };
            return self.basic(reader, width, height, stream, filter).await;
        }

        match control >> 4 {
            // Fill: one CPIXEL replicated across the rectangle.
            0b1000 => {
                let bytes = read_bytes(reader, 3).await?;
                Ok(vec![Color::new(bytes[0], bytes[1], bytes[2]); area])
            }
            // JPEG: compact length, then a JFIF stream decoded externally.
            0b1001 => {
                let length = read_compact_length(reader).await?;
                let data = read_bytes(reader, length).await?;
                let rgb = jpeg
                    .decode_rgb(&data)
                    .map_err(|e| Error::decode(format!("JPEG rectangle: {e}")))?;
                if rgb.len() != area * 3 {
                    return Err(Error::decode(format!(
                        "JPEG decoded to {} bytes, expected {}",
                        rgb.len(),
                        area * 3
                    )));
                }
                Ok(colors_from_cpixels(&rgb))
            }
            _ => Err(Error::protocol(format!(
                "invalid Tight compression control byte {control:#010b}"
            ))),
        }
    }

    async fn basic<R>(
        &mut self,
        reader: &mut R,
        width: u16,
        height: u16,
        stream: usize,
        filter: u8,
    ) -> Result<Vec<Color>>
    where
        R: AsyncRead + Unpin,
    {
        let area = width as usize * height as usize;
        match filter {
            FILTER_COPY => {
                let data = self.filtered_payload(reader, area * 3, stream).await?;
                Ok(colors_from_cpixels(&data))
            }
            FILTER_PALETTE => {
                let palette_size = reader.read_u8().await? as usize + 1;
                // The palette travels outside the zlib stream.
                let palette = colors_from_cpixels(&read_bytes(reader, palette_size * 3).await?);

                let size = if palette_size == 2 {
                    (width as usize + 7) / 8 * height as usize
                } else {
                    area
                };
                let data = self.filtered_payload(reader, size, stream).await?;

                let mut colors = Vec::with_capacity(area);
                if palette_size == 2 {
                    // One bit per pixel, MSB first, each row byte-aligned.
                    let row_bytes = (width as usize + 7) / 8;
                    for row in 0..height as usize {
                        for col in 0..width as usize {
                            let byte = data[row * row_bytes + col / 8];
                            let bit = (byte >> (7 - col % 8)) & 1;
                            colors.push(palette[bit as usize]);
                        }
                    }
                } else {
                    for &index in &data {
                        let color = palette.get(index as usize).copied().ok_or_else(|| {
                            Error::decode(format!(
                                "palette index {index} out of range for palette of {palette_size}"
                            ))
                        })?;
                        colors.push(color);
                    }
                }
                Ok(colors)
            }
            FILTER_GRADIENT => {
                let diffs = self.filtered_payload(reader, area * 3, stream).await?;
                Ok(unfilter_gradient(&diffs, width, height))
            }
            other => Err(Error::protocol(format!("invalid Tight filter id {other}"))),
        }
    }

    /// Produce exactly `size` post-filter bytes: verbatim from the socket
    /// when below the zlib exemption threshold, otherwise by feeding the
    /// compact-length-framed segment to the selected stream.
    async fn filtered_payload<R>(
        &mut self,
        reader: &mut R,
        size: usize,
        stream: usize,
    ) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        if size < ZLIB_MIN {
            return Ok(read_bytes(reader, size).await?);
        }

        let length = read_compact_length(reader).await?;
        let segment = read_bytes(reader, length).await?;

        let slot = &mut self.streams[stream];
        if self.reset_mask & (1 << stream) != 0 {
            slot.reset();
            self.reset_mask &= !(1 << stream);
        }

        let inflated = slot.inflator.inflate(&segment)?;
        slot.pending.extend_from_slice(&inflated);
        if slot.pending.len() < size {
            return Err(Error::decode(format!(
                "Tight stream {stream} produced {} of {size} filtered bytes",
                slot.pending.len()
            )));
        }
        Ok(slot.pending.drain(..size).collect())
    }
}

/// Undo the gradient filter: each channel holds the difference from a
/// prediction built out of the left, upper and upper-left neighbors, with
/// out-of-rectangle pixels taken as zero.
fn unfilter_gradient(diffs: &[u8], width: u16, height: u16) -> Vec<Color> {
    let width = width as usize;
    let height = height as usize;
    let mut out = vec![0u8; diffs.len()];

    for row in 0..height {
        for col in 0..width {
            for channel in 0..3 {
                let at = |r: isize, c: isize| -> i32 {
                    if r < 0 || c < 0 {
                        0
                    } else {
                        out[(r as usize * width + c as usize) * 3 + channel] as i32
                    }
                };
                let predicted = (at(row as isize - 1, col as isize)
                    + at(row as isize, col as isize - 1)
                    - at(row as isize - 1, col as isize - 1))
                .clamp(0, 255) as u8;
                let index = (row * width + col) * 3 + channel;
                out[index] = diffs[index].wrapping_add(predicted);
            }
        }
    }
    colors_from_cpixels(&out)
}

/// Compact length: seven payload bits per byte, high bit means another byte
/// follows, at most three bytes (22 bits of length).
pub(crate) async fn read_compact_length<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut value = 0usize;
    let mut shift = 0;
    for i in 0..3 {
        let byte = reader.read_u8().await?;
        if byte < 0x80 || i == 2 {
            return Ok(value | (byte as usize) << shift);
        }
        value |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
    }
    unreachable!("compact length terminates within three bytes")
}

/// Compact-length writer, the encoder-side inverse of
/// [`read_compact_length`].
pub(crate) fn compact_length_bytes(value: usize) -> Vec<u8> {
    debug_assert!(value < 1 << 22);
    if value < 1 << 7 {
        vec![value as u8]
    } else if value < 1 << 14 {
        vec![(value & 0x7f) as u8 | 0x80, (value >> 7) as u8]
    } else {
        vec![
            (value & 0x7f) as u8 | 0x80,
            ((value >> 7) & 0x7f) as u8 | 0x80,
            (value >> 14) as u8,
        ]
    }
}
