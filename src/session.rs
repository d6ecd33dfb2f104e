//! The per-connection session engine.
//!
//! Each session runs one background task that connects (with backoff),
//! negotiates the pixel format and encodings, then reads server messages
//! forever. Decoded updates land in the back buffer immediately and are
//! also queued in the deferred-update log; consumers call [`Session::step`]
//! to swap buffers and collect the log. When the log reaches its bound the
//! session stops requesting updates until the next swap drains it.

use crate::config::{Region, SessionConfig};
use crate::error::{Error, Result};
use crate::event::VncEvent;
use crate::jpeg::{JpegDecoder, NoJpeg};
use crate::protocol::client::{self, MessageWriter};
use crate::protocol::messages::{FramebufferUpdate, ServerMessage, ServerStream};
use crate::protocol::wire::PixelFormat;
use crate::screen::Screen;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// Observable session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The background task is still dialing or handshaking.
    Connecting,
    /// Connected and receiving updates.
    Running,
    /// Connected, but the deferred-update log hit its bound; update
    /// requests are suppressed until the next step.
    Paused,
    /// Closed by the consumer or poisoned by an error.
    Closed,
}

/// What one step hands back: the stable front screen (once connected) and
/// the updates applied since the previous step, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub screen: Option<Arc<Screen>>,
    pub updates: Vec<Arc<FramebufferUpdate>>,
}

/// One live VNC connection with a double-buffered screen.
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    label: String,
    /// Signalled after the reader applies each update.
    updated: Notify,
    state: Mutex<State>,
}

struct State {
    conn: Option<ConnHandle>,
    front: Option<Arc<Screen>>,
    back: Option<Screen>,
    /// True when the back buffer holds updates the front buffer has not
    /// seen; the next step swaps.
    back_updated: bool,
    deferred: Vec<Arc<FramebufferUpdate>>,
    max_deferred: usize,
    paused: bool,
    subscription: Vec<Region>,
    err: Option<Error>,
    closed: bool,
    shutdown: Option<mpsc::Sender<()>>,
}

#[derive(Clone)]
struct ConnHandle {
    writer: Arc<AsyncMutex<MessageWriter<OwnedWriteHalf>>>,
    width: u16,
    height: u16,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn poison(&self, error: Error) {
        let mut state = self.lock();
        if state.err.is_none() && !state.closed {
            warn!(session = %self.label, %error, "session failed");
            state.err = Some(error);
        }
        drop(state);
        self.updated.notify_waiters();
    }
}

impl Session {
    /// Validate the configuration and spawn the connection task. Must be
    /// called from within a tokio runtime.
    pub fn open(name: impl Into<String>, config: SessionConfig) -> Result<Self> {
        Self::open_with_jpeg(name, config, Arc::new(NoJpeg))
    }

    /// Like [`Session::open`] with a JPEG decoder for Tight's
    /// JpegCompression rectangles.
    pub fn open_with_jpeg(
        name: impl Into<String>,
        config: SessionConfig,
        jpeg: Arc<dyn JpegDecoder>,
    ) -> Result<Self> {
        config.validate()?;
        let config = config.normalized();

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let label = format!("{}:{}:{}", id, name.into(), config.address);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let inner = Arc::new(Inner {
            label,
            updated: Notify::new(),
            state: Mutex::new(State {
                conn: None,
                front: None,
                back: None,
                back_updated: false,
                deferred: Vec::new(),
                max_deferred: config.max_deferred_updates,
                paused: false,
                subscription: config.subscription.clone(),
                err: None,
                closed: false,
                shutdown: Some(shutdown_tx),
            }),
        });

        tokio::spawn(run(inner.clone(), config, jpeg, shutdown_rx));
        Ok(Self { inner })
    }

    /// Send `events`, swap screens if the back buffer changed, and collect
    /// the updates applied since the previous step.
    ///
    /// Returns the sticky session error once the reader has failed; until
    /// the connection is established it returns an empty outcome.
    pub async fn step(&self, events: &[VncEvent]) -> Result<StepOutcome> {
        let conn = {
            let state = self.inner.lock();
            if let Some(err) = &state.err {
                return Err(err.clone());
            }
            if state.closed {
                return Err(Error::Closed);
            }
            match &state.conn {
                Some(conn) => conn.clone(),
                None => {
                    return Ok(StepOutcome {
                        screen: None,
                        updates: Vec::new(),
                    })
                }
            }
        };

        if !events.is_empty() {
            let mut writer = conn.writer.lock().await;
            for event in events {
                writer.send_event(event).await?;
            }
        }

        let (screen, updates, resume) = self.flip()?;

        if resume {
            info!(session = %self.inner.label, "deferred log drained, resuming updates");
            let subscription = self.inner.lock().subscription.clone();
            let mut writer = conn.writer.lock().await;
            if let Err(err) = writer
                .request_updates(&subscription, conn.width, conn.height)
                .await
            {
                self.inner.poison(err.clone());
                return Err(err);
            }
        }

        Ok(StepOutcome {
            screen: Some(screen),
            updates,
        })
    }

    /// Swap front and back if the back buffer advanced, replaying the
    /// handed-out updates into the new back buffer so the two converge.
    fn flip(&self) -> Result<(Arc<Screen>, Vec<Arc<FramebufferUpdate>>, bool)> {
        let mut state = self.inner.lock();
        let state = &mut *state;

        if !state.back_updated {
            let front = state.front.clone().ok_or(Error::Closed)?;
            return Ok((front, Vec::new(), false));
        }

        let (Some(back), Some(old_front)) = (state.back.take(), state.front.take()) else {
            return Err(Error::Closed);
        };
        let front = Arc::new(back);
        state.front = Some(front.clone());

        // Reuse the old front allocation when the consumer has let go of
        // it, otherwise give them their snapshot and start from a copy.
        let mut new_back = match Arc::try_unwrap(old_front) {
            Ok(screen) => screen,
            Err(shared) => (*shared).clone(),
        };

        let updates = std::mem::take(&mut state.deferred);
        for update in &updates {
            apply_update(&mut new_back, update)?;
        }
        state.back = Some(new_back);
        state.back_updated = false;

        let resume = state.paused;
        state.paused = false;

        Ok((front, updates, resume))
    }

    /// Send clipboard text to the server (ClientCutText). Dropped while
    /// the connection is still being established, like step events.
    pub async fn send_cut_text(&self, text: &str) -> Result<()> {
        let conn = {
            let state = self.inner.lock();
            if let Some(err) = &state.err {
                return Err(err.clone());
            }
            if state.closed {
                return Err(Error::Closed);
            }
            match &state.conn {
                Some(conn) => conn.clone(),
                None => {
                    debug!(session = %self.inner.label, "cut text dropped, not connected yet");
                    return Ok(());
                }
            }
        };
        let result = conn.writer.lock().await.cut_text(text).await;
        result
    }

    /// Replace the subscribed regions; takes effect at the next update
    /// request.
    pub fn set_subscription(&self, regions: Vec<Region>) {
        self.inner.lock().subscription = regions;
    }

    /// The current front buffer without flipping.
    pub fn peek(&self) -> Option<Arc<Screen>> {
        self.inner.lock().front.clone()
    }

    /// A snapshot of the back buffer without flipping.
    pub fn peek_back(&self) -> Option<Screen> {
        self.inner.lock().back.clone()
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.inner.lock();
        if state.closed || state.err.is_some() {
            SessionStatus::Closed
        } else if state.conn.is_none() {
            SessionStatus::Connecting
        } else if state.paused {
            SessionStatus::Paused
        } else {
            SessionStatus::Running
        }
    }

    /// The sticky error, if the session has failed.
    pub fn last_error(&self) -> Option<Error> {
        self.inner.lock().err.clone()
    }

    /// Framebuffer dimensions, once connected.
    pub fn size(&self) -> Option<(u16, u16)> {
        self.inner.lock().conn.as_ref().map(|c| (c.width, c.height))
    }

    /// Wait until the reader signals another applied update (or the
    /// session fails). Wakes only waiters registered before the signal.
    pub async fn updated(&self) {
        self.inner.updated.notified().await;
    }

    /// Close the session. Idempotent; the background task aborts at its
    /// next await point and the socket is dropped.
    pub fn close(&self) {
        let shutdown = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.conn = None;
            state.shutdown.take()
        };
        debug!(session = %self.inner.label, "closing session");
        // Dropping the sender wakes the task's shutdown receiver.
        drop(shutdown);
        self.inner.updated.notify_waiters();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Background task: connect, read, and surface the first failure as the
/// session's sticky error.
async fn run(
    inner: Arc<Inner>,
    config: SessionConfig,
    jpeg: Arc<dyn JpegDecoder>,
    mut shutdown: mpsc::Receiver<()>,
) {
    let result = tokio::select! {
        _ = shutdown.recv() => {
            debug!(session = %inner.label, "session task shut down");
            return;
        }
        result = drive(&inner, &config, jpeg) => result,
    };

    if let Err(err) = result {
        inner.poison(err);
    }
}

/// Connect with retry, negotiate, then run the receive loop until the
/// connection dies.
async fn drive(
    inner: &Arc<Inner>,
    config: &SessionConfig,
    jpeg: Arc<dyn JpegDecoder>,
) -> Result<()> {
    info!(session = %inner.label, "opening connection to VNC server");

    let budget = config.start_timeout();
    let mut slept = Duration::ZERO;
    let mut attempt: u64 = 0;
    let conn = loop {
        match client::establish(config).await {
            Ok(conn) => break conn,
            Err(failure) if failure.soft && !budget.is_zero() => {
                if slept >= budget {
                    warn!(
                        session = %inner.label,
                        timeout = ?budget,
                        "start timeout exceeded while waiting for server"
                    );
                    return Err(failure.error);
                }
                let pause = Duration::from_secs((2 * (attempt + 1)).min(30));
                info!(
                    session = %inner.label,
                    error = %failure.error,
                    retry_in = ?pause,
                    slept = ?slept,
                    "VNC server not yet connectable"
                );
                slept += pause;
                attempt += 1;
                tokio::time::sleep(pause).await;
            }
            Err(failure) => return Err(failure.error),
        }
    };

    let width = conn.init.width;
    let height = conn.init.height;
    let format = PixelFormat::rgb888(config.red_shift, config.green_shift, config.blue_shift);
    let (read_half, mut writer) = conn.into_parts();

    // Force the pixel format every decoder in this crate assumes, then
    // advertise the encodings we can actually decode.
    writer.set_pixel_format(&format).await?;
    writer.set_encodings(&client::offered_encodings(config)).await?;

    let writer = Arc::new(AsyncMutex::new(writer));
    let conn_handle = ConnHandle {
        writer: writer.clone(),
        width,
        height,
    };

    {
        let mut state = inner.lock();
        if state.closed {
            return Ok(());
        }
        state.front = Some(Arc::new(Screen::new(width, height)));
        state.back = Some(Screen::new(width, height));
        state.conn = Some(conn_handle);
    }
    info!(session = %inner.label, width, height, "connection established");

    {
        let subscription = inner.lock().subscription.clone();
        writer
            .lock()
            .await
            .request_updates(&subscription, width, height)
            .await?;
    }

    let primary = client::offered_encodings(config)[0];
    let mut stream = ServerStream::new(read_half, format, primary, jpeg);

    loop {
        let message = stream.next_message().await?;
        match message {
            ServerMessage::Update(update) => {
                let update = Arc::new(update);
                let (request, subscription) = {
                    let mut state = inner.lock();
                    if state.closed {
                        return Ok(());
                    }
                    let Some(back) = state.back.as_mut() else {
                        return Ok(());
                    };
                    apply_update(back, &update)?;
                    state.deferred.push(update);
                    state.back_updated = true;

                    if state.deferred.len() >= state.max_deferred && !state.paused {
                        info!(
                            session = %inner.label,
                            max = state.max_deferred,
                            "deferred log full, pausing updates"
                        );
                        state.paused = true;
                    }
                    (!state.paused, state.subscription.clone())
                };
                inner.updated.notify_waiters();

                if request {
                    writer
                        .lock()
                        .await
                        .request_updates(&subscription, width, height)
                        .await?;
                }
            }
            ServerMessage::Bell => debug!(session = %inner.label, "server bell"),
            ServerMessage::CutText(text) => {
                debug!(session = %inner.label, bytes = text.len(), "server cut text");
            }
            ServerMessage::ColorMap { first_color, colors } => {
                debug!(
                    session = %inner.label,
                    first_color,
                    count = colors.len(),
                    "color map entries updated"
                );
            }
        }
    }
}

/// Copy every pixel-carrying rectangle into the screen, row by row.
/// Cursor pseudo-rectangles never touch the screen.
fn apply_update(screen: &mut Screen, update: &FramebufferUpdate) -> Result<()> {
    for rect in &update.rectangles {
        let Some(colors) = rect.data.colors() else {
            continue;
        };
        let x = rect.x as usize;
        let y = rect.y as usize;
        let width = rect.width as usize;
        let height = rect.height as usize;
        if x + width > screen.width as usize || y + height > screen.height as usize {
            return Err(Error::protocol(format!(
                "rectangle {}x{} at {},{} outside the {}x{} framebuffer",
                rect.width, rect.height, rect.x, rect.y, screen.width, screen.height
            )));
        }

        for row in 0..height {
            let src = row * width;
            let dst = (y + row) * screen.width as usize + x;
            screen.data[dst..dst + width].copy_from_slice(&colors[src..src + width]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{RectData, Rectangle};
    use crate::screen::Color;

    fn rect(x: u16, y: u16, width: u16, height: u16, color: Color) -> Rectangle {
        Rectangle {
            x,
            y,
            width,
            height,
            data: RectData::Raw(vec![color; width as usize * height as usize]),
        }
    }

    #[test]
    fn updates_land_at_their_offsets() {
        let mut screen = Screen::new(4, 4);
        let update = FramebufferUpdate {
            rectangles: vec![
                rect(0, 0, 4, 4, Color::new(1, 1, 1)),
                rect(2, 1, 2, 2, Color::new(9, 9, 9)),
            ],
        };
        apply_update(&mut screen, &update).unwrap();

        assert_eq!(screen.pixel(0, 0), Some(Color::new(1, 1, 1)));
        assert_eq!(screen.pixel(2, 1), Some(Color::new(9, 9, 9)));
        assert_eq!(screen.pixel(3, 2), Some(Color::new(9, 9, 9)));
        assert_eq!(screen.pixel(1, 1), Some(Color::new(1, 1, 1)));
        assert_eq!(screen.pixel(2, 3), Some(Color::new(1, 1, 1)));
    }

    #[test]
    fn later_rectangles_overwrite_earlier_ones() {
        let mut screen = Screen::new(2, 1);
        let update = FramebufferUpdate {
            rectangles: vec![
                rect(0, 0, 2, 1, Color::new(1, 1, 1)),
                rect(0, 0, 1, 1, Color::new(2, 2, 2)),
            ],
        };
        apply_update(&mut screen, &update).unwrap();
        assert_eq!(screen.pixel(0, 0), Some(Color::new(2, 2, 2)));
        assert_eq!(screen.pixel(1, 0), Some(Color::new(1, 1, 1)));
    }

    #[test]
    fn out_of_bounds_rectangles_are_rejected() {
        let mut screen = Screen::new(2, 2);
        let update = FramebufferUpdate {
            rectangles: vec![rect(1, 1, 2, 1, Color::new(1, 1, 1))],
        };
        assert!(apply_update(&mut screen, &update).is_err());
    }

    #[test]
    fn cursor_rectangles_do_not_touch_the_screen() {
        let mut screen = Screen::new(2, 2);
        let update = FramebufferUpdate {
            rectangles: vec![Rectangle {
                x: 0,
                y: 0,
                width: 2,
                height: 2,
                data: RectData::Cursor(vec![0xff; 18]),
            }],
        };
        apply_update(&mut screen, &update).unwrap();
        assert_eq!(screen.pixel(0, 0), Some(Color::default()));
    }
}
