//! Interfaces of the collaborators the supervisor drives.
//!
//! The emulation core, renderer, debugger, movie playback and cheat engine
//! all live outside this crate; the worker talks to them through these
//! traits and nothing else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::ThreadContext;
use crate::keypad::KeySource;
use crate::sync::SyncChannel;
use crate::vfs::{VDir, VFile};
use crate::SupervisorResult;

/// Outcome of a single scheduling quantum of the emulation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStatus {
    Ok,
    /// A video frame was completed (and handed to the sync channel) during
    /// this quantum.
    FrameCompleted,
    /// The core hit an unrecoverable fault; the worker publishes `Crashed`.
    Crashed,
}

/// The emulation core, constructed on the worker by the host-supplied
/// factory and owned by the worker for its whole life.
pub trait EmuCore: Send {
    /// Receives the channel the core must post frames and audio through.
    fn connect_sync(&mut self, sync: Arc<SyncChannel>);

    /// Receives the live key state shared with the host.
    fn set_key_source(&mut self, keys: KeySource);

    /// Resize the core's sample ring buffer.
    fn resize_audio_buffer(&mut self, samples: usize) {
        let _ = samples;
    }

    /// Attach the frame sink the core renders into.
    fn set_renderer(&mut self, renderer: Box<dyn FrameSink>) {
        let _ = renderer;
    }

    fn load_rom(
        &mut self,
        rom: &mut dyn VFile,
        save: Option<&mut dyn VFile>,
        fname: Option<&str>,
    ) -> SupervisorResult<()>;

    fn load_bios(&mut self, bios: &mut dyn VFile) -> SupervisorResult<()> {
        let _ = bios;
        Ok(())
    }

    fn apply_patch(&mut self, patch: &mut dyn VFile) -> SupervisorResult<()> {
        let _ = patch;
        Ok(())
    }

    fn apply_override(&mut self, ov: &GameOverride) {
        let _ = ov;
    }

    fn attach_cheats(&mut self, cheats: Box<dyn CheatDevice>) {
        let _ = cheats;
    }

    /// Game code of the loaded ROM, used to match override table entries.
    fn game_code(&self) -> Option<String> {
        None
    }

    fn reset(&mut self);

    fn skip_bios(&mut self) {}

    /// Advance emulation by one scheduling quantum. Implementations should
    /// poll [`CoreSignals::preempt_requested`] and return early when it is
    /// raised.
    fn run_quantum(&mut self) -> CoreStatus;
}

/// Renderer the core draws into; the consumer thread reads it back out
/// between `wait_frame_start` and dropping the frame guard.
pub trait FrameSink: Send {
    /// Gives the sink the channel its consumer must rendezvous with.
    fn associate(&mut self, sync: Arc<SyncChannel>);

    /// Last completed frame as (stride in pixels, packed pixels).
    fn get_pixels(&mut self) -> (usize, &[u32]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerState {
    Running,
    Paused,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterReason {
    Attached,
    Manual,
    Breakpoint,
    Watchpoint,
    IllegalOp,
}

/// Debugger session driven from the worker thread. When attached, the
/// worker hands it the core once per outer loop iteration instead of
/// running quanta itself.
pub trait Debugger: Send {
    fn enter(&mut self, reason: EnterReason);
    fn run(&mut self, core: &mut dyn EmuCore);
    fn state(&self) -> DebuggerState;
}

/// Movie playback context; dropped (destroyed) during worker teardown.
pub trait Movie: Send {
    fn start_playing(&mut self, autostart: bool);
}

/// Cheat engine; ownership moves into the core on attach.
pub trait CheatDevice: Send {
    fn parse_file(&mut self, vf: &mut dyn VFile) -> SupervisorResult<()>;
}

/// Per-game quirk entry applied after ROM load.
#[derive(Debug, Clone, Default)]
pub struct GameOverride {
    pub game_code: String,
    pub save_type: Option<String>,
    pub idle_loop: Option<u32>,
}

/// Low-latency flags shared between host transitions and the core's run
/// loop. `preempt` is raised by `interrupt` so a conforming core returns
/// from its quantum as soon as possible; `halted` is cleared by `end` so a
/// halted CPU cannot keep the worker asleep past shutdown.
#[derive(Debug, Default)]
pub struct CoreSignals {
    preempt: AtomicBool,
    halted: AtomicBool,
}

impl CoreSignals {
    pub fn request_preempt(&self) {
        self.preempt.store(true, Ordering::Release);
    }

    #[inline]
    pub fn preempt_requested(&self) -> bool {
        self.preempt.load(Ordering::Acquire)
    }

    pub(crate) fn take_preempt(&self) -> bool {
        self.preempt.swap(false, Ordering::AcqRel)
    }

    pub fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::Release);
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

/// Builds the emulation core on the worker thread.
pub type CoreFactory = Box<dyn FnOnce(&ThreadContext) -> Box<dyn EmuCore> + Send>;

/// Turns an opened movie directory into a playback context.
pub type MovieFactory = Box<dyn FnOnce(Box<dyn VDir>) -> Option<Box<dyn Movie>> + Send>;

/// One-shot lifecycle hook, invoked on the worker with the live context.
pub type LifecycleCallback = Box<dyn FnOnce(&ThreadContext) + Send>;

/// Invoked on the worker after every quantum that completed a frame.
pub type FrameCallback = Box<dyn FnMut(&ThreadContext) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preempt_signal_round_trip() {
        let signals = CoreSignals::default();
        assert!(!signals.preempt_requested());

        signals.request_preempt();
        assert!(signals.preempt_requested());

        assert!(signals.take_preempt());
        assert!(!signals.preempt_requested());
        assert!(!signals.take_preempt());
    }

    #[test]
    fn test_halted_signal_reflects_last_store() {
        let signals = CoreSignals::default();
        assert!(!signals.is_halted());

        signals.set_halted(true);
        assert!(signals.is_halted());

        signals.set_halted(false);
        assert!(!signals.is_halted());
    }
}
