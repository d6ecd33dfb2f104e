//! Mock RFB server helpers shared by the integration tests.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use vncpool::{PixelFormat, SessionConfig};

pub async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    (listener, addr)
}

pub fn config(addr: &str) -> SessionConfig {
    SessionConfig {
        address: addr.to_string(),
        password: "secret".to_string(),
        encoding: vncpool::PreferredEncoding::Raw,
        ..SessionConfig::default()
    }
}

/// Accept one client, run the 3.8 + None server side of the handshake, and
/// swallow the client's negotiation messages up to and including its
/// initial update requests (one per subscribed region, one otherwise).
pub async fn accept_ready(
    listener: &TcpListener,
    width: u16,
    height: u16,
    initial_requests: usize,
) -> TcpStream {
    let (mut stream, _) = listener.accept().await.expect("accept");

    stream.write_all(b"RFB 003.008\n").await.unwrap();
    let mut version = [0u8; 12];
    stream.read_exact(&mut version).await.unwrap();
    assert_eq!(&version, b"RFB 003.008\n");

    stream.write_all(&[1, 1]).await.unwrap(); // one security type: None
    assert_eq!(stream.read_u8().await.unwrap(), 1);
    stream.write_u32(0).await.unwrap(); // SecurityResult

    assert_eq!(stream.read_u8().await.unwrap(), 1); // shared flag

    stream.write_u16(width).await.unwrap();
    stream.write_u16(height).await.unwrap();
    stream
        .write_all(&PixelFormat::rgb888(0, 8, 16).to_bytes())
        .await
        .unwrap();
    stream.write_u32(4).await.unwrap();
    stream.write_all(b"mock").await.unwrap();

    // SetPixelFormat.
    let mut set_pixel_format = [0u8; 20];
    stream.read_exact(&mut set_pixel_format).await.unwrap();
    assert_eq!(set_pixel_format[0], 0);
    assert_eq!(set_pixel_format[4], 32); // forced 32 bpp

    // SetEncodings.
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 2);
    let count = u16::from_be_bytes([head[2], head[3]]) as usize;
    let mut ids = vec![0u8; count * 4];
    stream.read_exact(&mut ids).await.unwrap();

    for _ in 0..initial_requests {
        read_update_request(&mut stream).await;
    }
    stream
}

/// Read one FramebufferUpdateRequest and return (incremental, x, y, w, h).
pub async fn read_update_request(stream: &mut TcpStream) -> (bool, u16, u16, u16, u16) {
    let mut msg = [0u8; 10];
    stream.read_exact(&mut msg).await.unwrap();
    assert_eq!(msg[0], 3, "expected FramebufferUpdateRequest");
    (
        msg[1] != 0,
        u16::from_be_bytes([msg[2], msg[3]]),
        u16::from_be_bytes([msg[4], msg[5]]),
        u16::from_be_bytes([msg[6], msg[7]]),
        u16::from_be_bytes([msg[8], msg[9]]),
    )
}

/// Build a FramebufferUpdate message from (x, y, w, h, encoding, payload)
/// rectangles.
pub fn update_message(rects: &[(u16, u16, u16, u16, i32, Vec<u8>)]) -> Vec<u8> {
    let mut msg = vec![0u8, 0];
    msg.extend_from_slice(&(rects.len() as u16).to_be_bytes());
    for (x, y, w, h, encoding, payload) in rects {
        msg.extend_from_slice(&x.to_be_bytes());
        msg.extend_from_slice(&y.to_be_bytes());
        msg.extend_from_slice(&w.to_be_bytes());
        msg.extend_from_slice(&h.to_be_bytes());
        msg.extend_from_slice(&encoding.to_be_bytes());
        msg.extend_from_slice(payload);
    }
    msg
}

/// A single Raw rectangle carrying one 32-bit little-endian pixel word per
/// pixel.
pub fn raw_rect(x: u16, y: u16, w: u16, h: u16, pixels: &[u32]) -> (u16, u16, u16, u16, i32, Vec<u8>) {
    assert_eq!(pixels.len(), w as usize * h as usize);
    let mut payload = Vec::with_capacity(pixels.len() * 4);
    for pixel in pixels {
        payload.extend_from_slice(&pixel.to_le_bytes());
    }
    (x, y, w, h, 0, payload)
}
