//! Connection establishment (RFC 6143 §7.1-§7.3) and client-to-server
//! messages.
//!
//! The handshake accepts protocol versions 3.3 and 3.8 and the None / VNC
//! Authentication security types. VNC Authentication is the DES
//! challenge-response, with the protocol's odd twist that every key byte is
//! bit-reversed.

use crate::config::{Region, SessionConfig};
use crate::encoding::{self, PseudoEncoding};
use crate::error::{Error, Result};
use crate::event::VncEvent;
use crate::protocol::wire::{read_bytes, PixelFormat};
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

const SET_PIXEL_FORMAT: u8 = 0;
const SET_ENCODINGS: u8 = 2;
const FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
const CLIENT_CUT_TEXT: u8 = 6;

const SECURITY_NONE: u8 = 1;
const SECURITY_VNC_AUTH: u8 = 2;

/// Upper bound on server-supplied string lengths; anything larger is a
/// corrupt stream, not a desktop name.
const MAX_STRING: u32 = 1 << 20;

/// A connect-phase failure plus whether retrying could help.
pub(crate) struct ConnectFailure {
    pub error: Error,
    pub soft: bool,
}

/// ServerInit contents (RFC 6143 §7.3.2).
#[derive(Debug, Clone)]
pub(crate) struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
}

/// An established connection that has completed the handshake.
pub(crate) struct ClientConn {
    stream: TcpStream,
    pub init: ServerInit,
}

impl ClientConn {
    pub(crate) fn into_parts(self) -> (BufReader<OwnedReadHalf>, MessageWriter<OwnedWriteHalf>) {
        let (read_half, write_half) = self.stream.into_split();
        (BufReader::new(read_half), MessageWriter::new(write_half))
    }
}

/// Open a TCP connection and run the handshake.
pub(crate) async fn establish(
    config: &SessionConfig,
) -> std::result::Result<ClientConn, ConnectFailure> {
    let mut stream = connect_tcp(&config.address).await.map_err(|error| {
        // Anything failing at the socket level may resolve on retry.
        ConnectFailure { soft: true, error }
    })?;

    let init = handshake(&mut stream, config)
        .await
        .map_err(|error| ConnectFailure {
            soft: error.is_soft(),
            error,
        })?;

    info!(
        address = %config.address,
        name = %init.name,
        width = init.width,
        height = init.height,
        "VNC handshake complete"
    );
    Ok(ClientConn { stream, init })
}

async fn connect_tcp(address: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Run the full RFB handshake: version, security, ClientInit, ServerInit.
pub(crate) async fn handshake<S>(stream: &mut S, config: &SessionConfig) -> Result<ServerInit>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Protocol version: "RFB xxx.yyy\n".
    let version = read_bytes(stream, 12).await?;
    let minor = parse_version(&version)?;
    let our_version: &[u8] = if minor >= 8 {
        b"RFB 003.008\n"
    } else {
        b"RFB 003.003\n"
    };
    stream.write_all(our_version).await?;
    debug!(server = %String::from_utf8_lossy(&version).trim(), "negotiated protocol version");

    if minor >= 8 {
        security_38(stream, config).await?;
    } else {
        security_33(stream, config).await?;
    }

    // ClientInit: request a shared session.
    stream.write_all(&[1]).await?;

    // ServerInit.
    let width = stream.read_u16().await?;
    let height = stream.read_u16().await?;
    let mut format_bytes = [0u8; 16];
    stream.read_exact(&mut format_bytes).await?;
    let pixel_format = PixelFormat::from_bytes(&format_bytes);

    let name_len = stream.read_u32().await?;
    if name_len > MAX_STRING {
        return Err(Error::protocol(format!(
            "implausible desktop name length {name_len}"
        )));
    }
    let name_bytes = read_bytes(stream, name_len as usize).await?;
    let name = String::from_utf8_lossy(&name_bytes).into_owned();

    Ok(ServerInit {
        width,
        height,
        pixel_format,
        name,
    })
}

fn parse_version(version: &[u8]) -> Result<u32> {
    let text = std::str::from_utf8(version)
        .map_err(|_| Error::protocol("protocol version is not ASCII"))?;
    if text.len() != 12 || !text.starts_with("RFB ") || &text[7..8] != "." || !text.ends_with('\n')
    {
        return Err(Error::protocol(format!("malformed protocol version {text:?}")));
    }
    let major: u32 = text[4..7]
        .parse()
        .map_err(|_| Error::protocol(format!("malformed protocol version {text:?}")))?;
    let minor: u32 = text[8..11]
        .parse()
        .map_err(|_| Error::protocol(format!("malformed protocol version {text:?}")))?;

    if major != 3 || (minor != 3 && minor < 8) {
        return Err(Error::protocol(format!(
            "unsupported protocol version {}.{}",
            major, minor
        )));
    }
    Ok(minor)
}

/// RFB 3.8 security: the server lists its types and both sides confirm the
/// result, with a reason string on failure.
async fn security_38<S>(stream: &mut S, config: &SessionConfig) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let count = stream.read_u8().await?;
    if count == 0 {
        let reason = read_reason(stream).await?;
        return Err(Error::Auth(format!("server refused connection: {reason}")));
    }
    let offered = read_bytes(stream, count as usize).await?;
    debug!(?offered, "security types offered");

    let choice = if offered.contains(&SECURITY_VNC_AUTH) {
        SECURITY_VNC_AUTH
    } else if offered.contains(&SECURITY_NONE) {
        SECURITY_NONE
    } else {
        return Err(Error::Auth(format!(
            "no supported security type among {offered:?}"
        )));
    };
    stream.write_all(&[choice]).await?;

    if choice == SECURITY_VNC_AUTH {
        vnc_auth(stream, &config.password).await?;
    }

    // SecurityResult is sent for both types in 3.8.
    if stream.read_u32().await? != 0 {
        let reason = read_reason(stream).await.unwrap_or_default();
        return Err(Error::Auth(format!(
            "server rejected authentication: {reason}"
        )));
    }
    Ok(())
}

/// RFB 3.3 security: the server dictates a single type; no result word is
/// sent for None.
async fn security_33<S>(stream: &mut S, config: &SessionConfig) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.read_u32().await? {
        0 => {
            let reason = read_reason(stream).await?;
            Err(Error::Auth(format!("server refused connection: {reason}")))
        }
        1 => Ok(()),
        2 => {
            vnc_auth(stream, &config.password).await?;
            if stream.read_u32().await? != 0 {
                return Err(Error::Auth("server rejected authentication".to_string()));
            }
            Ok(())
        }
        other => Err(Error::protocol(format!(
            "unsupported 3.3 security type {other}"
        ))),
    }
}

async fn vnc_auth<S>(stream: &mut S, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; 16];
    stream.read_exact(&mut challenge).await?;
    let response = encrypt_challenge(&challenge, password);
    stream.write_all(&response).await?;
    Ok(())
}

/// Encrypt the 16-byte challenge with DES, two blocks under one key built
/// from the password with every byte's bits reversed.
pub(crate) fn encrypt_challenge(challenge: &[u8; 16], password: &str) -> [u8; 16] {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.bytes()) {
        *slot = byte.reverse_bits();
    }

    let cipher = Des::new_from_slice(&key).expect("DES key is always 8 bytes");
    let mut response = *challenge;
    for block in response.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    response
}

async fn read_reason<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await?;
    if len > MAX_STRING {
        return Err(Error::protocol(format!("implausible reason length {len}")));
    }
    let bytes = read_bytes(stream, len as usize).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// The encodings offered in SetEncodings: the primary encoding, any level
/// hints, and the cursor pseudo-encoding.
pub(crate) fn offered_encodings(config: &SessionConfig) -> Vec<i32> {
    let primary = match config.encoding {
        crate::config::PreferredEncoding::Raw => encoding::RAW,
        crate::config::PreferredEncoding::Tight => encoding::TIGHT,
        crate::config::PreferredEncoding::Zrle => encoding::ZRLE,
    };

    let mut ids = vec![primary];
    if let Some(level) = config.quality_level {
        ids.push(PseudoEncoding::Quality(level).id());
    }
    if let Some(level) = config.compress_level {
        ids.push(PseudoEncoding::Compress(level).id());
    }
    if let Some(level) = config.fine_quality_level {
        ids.push(PseudoEncoding::FineQuality(level).id());
    }
    if let Some(level) = config.subsample_level {
        ids.push(PseudoEncoding::Subsample(level).id());
    }
    ids.push(encoding::CURSOR_PSEUDO);
    ids
}

/// Writer for every client-to-server message.
pub(crate) struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self { writer }
    }

    pub(crate) async fn set_pixel_format(&mut self, format: &PixelFormat) -> Result<()> {
        let mut msg = [0u8; 20];
        msg[0] = SET_PIXEL_FORMAT;
        // Three padding bytes.
        msg[4..20].copy_from_slice(&format.to_bytes());
        Ok(self.writer.write_all(&msg).await?)
    }

    pub(crate) async fn set_encodings(&mut self, encodings: &[i32]) -> Result<()> {
        let mut msg = vec![0u8; 4 + encodings.len() * 4];
        msg[0] = SET_ENCODINGS;
        // One padding byte.
        msg[2..4].copy_from_slice(&(encodings.len() as u16).to_be_bytes());
        for (i, id) in encodings.iter().enumerate() {
            msg[4 + i * 4..8 + i * 4].copy_from_slice(&id.to_be_bytes());
        }
        Ok(self.writer.write_all(&msg).await?)
    }

    pub(crate) async fn update_request(
        &mut self,
        incremental: bool,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    ) -> Result<()> {
        let mut msg = [0u8; 10];
        msg[0] = FRAMEBUFFER_UPDATE_REQUEST;
        msg[1] = incremental as u8;
        msg[2..4].copy_from_slice(&x.to_be_bytes());
        msg[4..6].copy_from_slice(&y.to_be_bytes());
        msg[6..8].copy_from_slice(&width.to_be_bytes());
        msg[8..10].copy_from_slice(&height.to_be_bytes());
        Ok(self.writer.write_all(&msg).await?)
    }

    /// Incremental update requests covering the subscription, or the whole
    /// screen when no regions are subscribed.
    pub(crate) async fn request_updates(
        &mut self,
        regions: &[Region],
        width: u16,
        height: u16,
    ) -> Result<()> {
        if regions.is_empty() {
            return self.update_request(true, 0, 0, width, height).await;
        }
        for region in regions {
            self.update_request(true, region.x, region.y, region.width, region.height)
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn send_event(&mut self, event: &VncEvent) -> Result<()> {
        match event {
            VncEvent::Key(key) => Ok(self.writer.write_all(&key.to_wire()).await?),
            VncEvent::Pointer(pointer) => Ok(self.writer.write_all(&pointer.to_wire()).await?),
        }
    }

    pub(crate) async fn cut_text(&mut self, text: &str) -> Result<()> {
        let bytes = text.as_bytes();
        let mut msg = vec![0u8; 8 + bytes.len()];
        msg[0] = CLIENT_CUT_TEXT;
        // Three padding bytes.
        msg[4..8].copy_from_slice(&(bytes.len() as u32).to_be_bytes());
        msg[8..].copy_from_slice(bytes);
        Ok(self.writer.write_all(&msg).await?)
    }
}
