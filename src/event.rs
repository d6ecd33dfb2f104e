//! Client input events and their RFB wire form.
//!
//! Events are queued by the consumer and written to the server at the start
//! of each step, before the screens are swapped.

use serde::{Deserialize, Serialize};

/// KeyEvent client message (RFB type 4).
///
/// `keysym` is an X11 keysym; `down` distinguishes press from release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub keysym: u32,
    pub down: bool,
}

/// PointerEvent client message (RFB type 5).
///
/// `buttons` is a bitmask with bit 0 = left, bit 1 = middle, bit 2 = right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerEvent {
    pub x: u16,
    pub y: u16,
    pub buttons: u8,
}

/// Any client input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VncEvent {
    Key(KeyEvent),
    Pointer(PointerEvent),
}

impl KeyEvent {
    /// Message type, down flag, two padding bytes, big-endian keysym.
    pub(crate) fn to_wire(self) -> [u8; 8] {
        let keysym = self.keysym.to_be_bytes();
        [
            4,
            self.down as u8,
            0,
            0,
            keysym[0],
            keysym[1],
            keysym[2],
            keysym[3],
        ]
    }
}

impl PointerEvent {
    /// Message type, button mask, big-endian X and Y.
    pub(crate) fn to_wire(self) -> [u8; 6] {
        let x = self.x.to_be_bytes();
        let y = self.y.to_be_bytes();
        [5, self.buttons, x[0], x[1], y[0], y[1]]
    }
}
