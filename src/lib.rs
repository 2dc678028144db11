//! Supervisor for a GBA emulation core.
//!
//! The host creates an [`EmuThread`], configures it with a ROM and its
//! peripheral collaborators, and starts a dedicated emulation worker. The
//! supervisor drives the worker's lifecycle (start / pause / resume / reset /
//! interrupt / stop) and arbitrates the frame and audio handoff between the
//! worker and the host's render and audio threads.

#[macro_use]
extern crate log;

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate smart_default;

use std::error::Error;
use std::fmt;

pub mod audio;
pub mod context;
pub mod interface;
pub mod keypad;
pub mod state;
pub mod sync;
pub mod thread;
pub mod vfs;
mod worker;

pub use context::{get_context, Arguments, Config, ThreadContext};
pub use state::ThreadState;
pub use sync::SyncChannel;
pub use thread::EmuThread;

#[derive(Debug)]
pub enum SupervisorError {
    IO(::std::io::Error),
    NoRomFound,
    NoCoreFactory,
    AlreadyRunning,
    ThreadPanicked,
    CoreLoadError(String),
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error: {:?}", self)
    }
}

impl Error for SupervisorError {
    fn description(&self) -> &str {
        "supervisor error"
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

impl From<::std::io::Error> for SupervisorError {
    fn from(err: ::std::io::Error) -> SupervisorError {
        SupervisorError::IO(err)
    }
}

pub mod prelude {
    pub use super::context::{get_context, Arguments, Config, IdleOptimization, ThreadContext};
    pub use super::interface::{
        CheatDevice, CoreSignals, CoreStatus, Debugger, DebuggerState, EmuCore, EnterReason,
        FrameSink, GameOverride, Movie,
    };
    pub use super::keypad::{KeySource, Keys, KEYINPUT_ALL_RELEASED};
    pub use super::state::ThreadState;
    pub use super::sync::SyncChannel;
    pub use super::thread::EmuThread;
    pub use super::{SupervisorError, SupervisorResult};
}
