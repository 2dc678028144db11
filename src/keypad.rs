//! Key input shared between the host and the core.

use std::sync::atomic::AtomicU16;
use std::sync::Arc;

pub const NUM_KEYS: usize = 10;
pub const KEYINPUT_ALL_RELEASED: u16 = 0b11_1111_1111;

bitflags! {
    /// GBA key bits. Active low: a cleared bit means pressed.
    pub struct Keys: u16 {
        const BUTTON_A = 1 << 0;
        const BUTTON_B = 1 << 1;
        const SELECT = 1 << 2;
        const START = 1 << 3;
        const RIGHT = 1 << 4;
        const LEFT = 1 << 5;
        const UP = 1 << 6;
        const DOWN = 1 << 7;
        const BUTTON_R = 1 << 8;
        const BUTTON_L = 1 << 9;
    }
}

/// Live key state, written by the host input loop and polled by the core.
pub type KeySource = Arc<AtomicU16>;

pub fn new_key_source() -> KeySource {
    Arc::new(AtomicU16::new(KEYINPUT_ALL_RELEASED))
}
