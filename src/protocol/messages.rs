//! Server-to-client messages (RFC 6143 §7.6) and the framebuffer-update
//! parser.

use crate::encoding::{self, raw, tight::TightDecoder, zrle::ZrleDecoder};
use crate::error::{Error, Result};
use crate::jpeg::JpegDecoder;
use crate::protocol::wire::{read_bytes, PixelFormat};
use crate::screen::Color;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

const MSG_FRAMEBUFFER_UPDATE: u8 = 0;
const MSG_SET_COLOR_MAP_ENTRIES: u8 = 1;
const MSG_BELL: u8 = 2;
const MSG_SERVER_CUT_TEXT: u8 = 3;

/// A server update with more rectangles than this is rejected outright.
const MAX_RECTANGLES: u16 = 1000;
/// Per-rectangle origin and size bounds, enforced before any allocation.
const MAX_X: u16 = 5120;
const MAX_Y: u16 = 2880;

/// Upper bound on the ServerCutText payload.
const MAX_CUT_TEXT: u32 = 1 << 20;

/// One parsed server message.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Update(FramebufferUpdate),
    ColorMap { first_color: u16, colors: Vec<Color> },
    Bell,
    CutText(String),
}

/// An ordered list of rectangles; later rectangles overwrite earlier
/// overlapping regions.
#[derive(Debug, Clone)]
pub struct FramebufferUpdate {
    pub rectangles: Vec<Rectangle>,
}

/// One decoded rectangle.
#[derive(Debug, Clone)]
pub struct Rectangle {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub data: RectData,
}

impl Rectangle {
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Decoded rectangle payload, tagged by the encoding that carried it.
#[derive(Debug, Clone)]
pub enum RectData {
    Raw(Vec<Color>),
    Zrle(Vec<Color>),
    Tight(Vec<Color>),
    /// Cursor shape bytes, kept verbatim; never drawn into the screen.
    Cursor(Vec<u8>),
}

impl RectData {
    /// The decoded pixels, or `None` for payloads that do not carry screen
    /// content.
    pub fn colors(&self) -> Option<&[Color]> {
        match self {
            RectData::Raw(colors) | RectData::Zrle(colors) | RectData::Tight(colors) => {
                Some(colors)
            }
            RectData::Cursor(_) => None,
        }
    }
}

/// The reading side of a session: owns the buffered socket half, the
/// per-session decoder state, and the color map.
pub(crate) struct ServerStream<R> {
    reader: R,
    format: PixelFormat,
    color_map: Box<[Color; 256]>,
    /// The negotiated primary encoding; Raw and the cursor pseudo-encoding
    /// are always accepted on top of it.
    primary: i32,
    zrle: ZrleDecoder,
    tight: TightDecoder,
    jpeg: Arc<dyn JpegDecoder>,
}

impl<R: AsyncRead + Unpin> ServerStream<R> {
    pub(crate) fn new(
        reader: R,
        format: PixelFormat,
        primary: i32,
        jpeg: Arc<dyn JpegDecoder>,
    ) -> Self {
        Self {
            reader,
            format,
            color_map: Box::new([Color::default(); 256]),
            primary,
            zrle: ZrleDecoder::new(),
            tight: TightDecoder::new(),
            jpeg,
        }
    }

    /// Block until one full server message has been read and decoded.
    pub(crate) async fn next_message(&mut self) -> Result<ServerMessage> {
        match self.reader.read_u8().await? {
            MSG_FRAMEBUFFER_UPDATE => Ok(ServerMessage::Update(self.read_update().await?)),
            MSG_SET_COLOR_MAP_ENTRIES => self.read_color_map().await,
            MSG_BELL => Ok(ServerMessage::Bell),
            MSG_SERVER_CUT_TEXT => self.read_cut_text().await,
            other => Err(Error::protocol(format!(
                "unknown server message type {other}"
            ))),
        }
    }

    async fn read_update(&mut self) -> Result<FramebufferUpdate> {
        let _padding = self.reader.read_u8().await?;
        let count = self.reader.read_u16().await?;
        if count > MAX_RECTANGLES {
            return Err(Error::protocol(format!(
                "excessive rectangle count {count}"
            )));
        }

        let mut rectangles = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let x = self.reader.read_u16().await?;
            let y = self.reader.read_u16().await?;
            let width = self.reader.read_u16().await?;
            let height = self.reader.read_u16().await?;
            let encoding_type = self.reader.read_i32().await?;

            // Area computations downstream must not overflow, and a corrupt
            // stream must not pick our allocation sizes.
            if x > MAX_X || width > MAX_X || y > MAX_Y || height > MAX_Y {
                return Err(Error::protocol(format!(
                    "excessive rectangle origin {x},{y} size {width}x{height} encoding {encoding_type}"
                )));
            }

            let data = match encoding_type {
                encoding::RAW => RectData::Raw(
                    raw::decode(&mut self.reader, width, height, &self.format, &self.color_map)
                        .await?,
                ),
                encoding::ZRLE if self.primary == encoding::ZRLE => RectData::Zrle(
                    self.zrle
                        .decode(&mut self.reader, width, height, &self.format)
                        .await?,
                ),
                encoding::TIGHT if self.primary == encoding::TIGHT => RectData::Tight(
                    self.tight
                        .decode(
                            &mut self.reader,
                            width,
                            height,
                            &self.format,
                            self.jpeg.as_ref(),
                        )
                        .await?,
                ),
                encoding::CURSOR_PSEUDO => RectData::Cursor(
                    encoding::read_cursor(&mut self.reader, width, height, &self.format).await?,
                ),
                other => {
                    return Err(Error::protocol(format!("unsupported encoding type {other}")))
                }
            };

            rectangles.push(Rectangle {
                x,
                y,
                width,
                height,
                data,
            });
        }
        Ok(FramebufferUpdate { rectangles })
    }

    /// SetColorMapEntries: each channel arrives as a U16; this codec keeps
    /// 8-bit channels and takes the high byte.
    async fn read_color_map(&mut self) -> Result<ServerMessage> {
        let _padding = self.reader.read_u8().await?;
        let first_color = self.reader.read_u16().await?;
        let count = self.reader.read_u16().await?;
        if first_color as usize + count as usize > self.color_map.len() {
            return Err(Error::protocol(format!(
                "color map update {first_color}+{count} beyond 256 entries"
            )));
        }

        let mut colors = Vec::with_capacity(count as usize);
        for i in 0..count {
            let r = (self.reader.read_u16().await? >> 8) as u8;
            let g = (self.reader.read_u16().await? >> 8) as u8;
            let b = (self.reader.read_u16().await? >> 8) as u8;
            let color = Color::new(r, g, b);
            self.color_map[(first_color + i) as usize] = color;
            colors.push(color);
        }
        debug!(first_color, count, "updated color map");
        Ok(ServerMessage::ColorMap {
            first_color,
            colors,
        })
    }

    async fn read_cut_text(&mut self) -> Result<ServerMessage> {
        let mut padding = [0u8; 3];
        self.reader.read_exact(&mut padding).await?;
        let length = self.reader.read_u32().await?;
        if length > MAX_CUT_TEXT {
            return Err(Error::protocol(format!(
                "implausible cut text length {length}"
            )));
        }
        let bytes = read_bytes(&mut self.reader, length as usize).await?;
        Ok(ServerMessage::CutText(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    }
}
