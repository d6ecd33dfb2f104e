//! Concurrent client-side driver for the RFB (VNC) protocol.
//!
//! vncpool maintains many simultaneous live connections to VNC servers and
//! exposes, per connection, a decoded RGB framebuffer plus an ordered log
//! of the updates behind it. Consumers drive sessions with a step-style
//! API: deliver input events, swap the double-buffered screen, and collect
//! everything that changed since the previous step.
//!
//! Supported pixel encodings are Raw, ZRLE and Tight (with its Fill, JPEG
//! and filtered-zlib sub-encodings), plus the cursor pseudo-encoding.
//! Sessions negotiate RFB 3.3 or 3.8 with None or VNC Authentication, and
//! always force a 32-bit little-endian true-color pixel format.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use vncpool::{Batch, SessionConfig};
//!
//! # async fn demo() -> vncpool::Result<()> {
//! let mut batch = Batch::new();
//! batch.open(
//!     "main",
//!     SessionConfig {
//!         address: "127.0.0.1:5900".to_string(),
//!         password: "secret".to_string(),
//!         ..SessionConfig::default()
//!     },
//! )?;
//!
//! let mut actions = HashMap::new();
//! actions.insert("main".to_string(), Vec::new());
//! let result = batch.step(&actions).await;
//! if let Some(Some(screen)) = result.screens.get("main") {
//!     println!("{}x{} pixels", screen.width, screen.height);
//! }
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod encoding;
pub mod error;
pub mod event;
pub mod fbs;
pub mod jpeg;
pub mod logging;
pub mod protocol;
pub mod screen;
pub mod session;
pub mod zlib;

pub use batch::{Batch, BatchStep};
pub use config::{PreferredEncoding, Region, SessionConfig};
pub use error::{Error, Result};
pub use event::{KeyEvent, PointerEvent, VncEvent};
pub use jpeg::{JpegDecoder, NoJpeg};
pub use protocol::messages::{FramebufferUpdate, RectData, Rectangle, ServerMessage};
pub use protocol::wire::PixelFormat;
pub use screen::{Color, Screen};
pub use session::{Session, SessionStatus, StepOutcome};
