//! Raw encoding (RFC 6143 §7.7.1): one pixel value per pixel, no
//! compression, converted through the negotiated shifts and channel maxima.

use crate::error::Result;
use crate::protocol::wire::{read_bytes, PixelFormat};
use crate::screen::Color;
use tokio::io::AsyncRead;

/// Decode a `width * height` Raw rectangle.
///
/// `color_map` supplies the palette for non-true-color formats; the session
/// engine always negotiates true color, but recorded streams may not have.
pub(crate) async fn decode<R>(
    reader: &mut R,
    width: u16,
    height: u16,
    format: &PixelFormat,
    color_map: &[Color; 256],
) -> Result<Vec<Color>>
where
    R: AsyncRead + Unpin,
{
    let bpp = format.bytes_per_pixel();
    let area = width as usize * height as usize;
    let data = read_bytes(reader, area * bpp).await?;

    let mut colors = Vec::with_capacity(area);
    for pixel in data.chunks_exact(bpp) {
        let raw = match bpp {
            1 => pixel[0] as u32,
            2 => {
                if format.big_endian {
                    u16::from_be_bytes([pixel[0], pixel[1]]) as u32
                } else {
                    u16::from_le_bytes([pixel[0], pixel[1]]) as u32
                }
            }
            _ => {
                if format.big_endian {
                    u32::from_be_bytes([pixel[0], pixel[1], pixel[2], pixel[3]])
                } else {
                    u32::from_le_bytes([pixel[0], pixel[1], pixel[2], pixel[3]])
                }
            }
        };

        if format.true_color {
            colors.push(Color::new(
                ((raw >> format.red_shift) & format.red_max as u32) as u8,
                ((raw >> format.green_shift) & format.green_max as u32) as u8,
                ((raw >> format.blue_shift) & format.blue_max as u32) as u8,
            ));
        } else {
            colors.push(color_map[(raw & 0xff) as usize]);
        }
    }
    Ok(colors)
}
