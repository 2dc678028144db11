//! The host-facing supervisor: lifecycle transitions and the worker thread
//! handle.
//!
//! Every transition serializes against the worker through the state mutex.
//! Three mutexes exist in total (state, video, audio) and no thread ever
//! holds two of them at once, with one documented exception:
//! [`ThreadContext::wait_until_not_state`] briefly takes the sync mutexes
//! while the state mutex is held in order to shake loose a blocked producer
//! or consumer. No cycle is possible because the sync side never takes the
//! state mutex.

use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};
use std::thread::{Builder, JoinHandle};

use crate::context::{ThreadContext, DEFAULT_FPS_TARGET};
use crate::interface::{CheatDevice, Debugger, EmuCore, FrameSink, GameOverride, MovieFactory};
use crate::keypad::KEYINPUT_ALL_RELEASED;
use crate::state::{StateData, ThreadState};
use crate::vfs::VFile;
use crate::worker;
use crate::{SupervisorError, SupervisorResult};

impl ThreadContext {
    /// Spin until the worker has left `old_state`, re-waking the state
    /// condition and both sync conditions each round so the worker cannot
    /// stay parked in `post_frame` or an audio wait. Video sync is turned
    /// off for the duration and restored afterwards. This is the only place
    /// that touches a sync mutex with the state mutex held.
    fn wait_until_not_state<'a>(
        &'a self,
        mut data: MutexGuard<'a, StateData>,
        old_state: ThreadState,
    ) -> MutexGuard<'a, StateData> {
        let video_wait = self.sync.suspend_video_wait();

        while data.state == old_state {
            drop(data);
            self.sync.nudge();
            data = self.state.lock();
            self.state.wake();
        }

        self.sync.restore_video_wait(video_wait);
        data
    }

    fn pause_thread<'a>(
        &'a self,
        mut data: MutexGuard<'a, StateData>,
        on_thread: bool,
    ) -> MutexGuard<'a, StateData> {
        data.state = ThreadState::Pausing;
        if !on_thread {
            data = self.wait_until_not_state(data, ThreadState::Pausing);
        }
        data
    }

    /// Request shutdown and wake everything that may be blocked. Waits out
    /// an in-flight interrupt first.
    pub fn end(&self) {
        {
            let mut data = self.state.lock();
            data = self.state.wait_on_interrupt(data);
            data.state = ThreadState::Exiting;
            self.signals.set_halted(false);
            self.state.wake();
        }
        self.sync.end_wakeup();
    }

    /// Schedule a CPU reset; the worker passes through `Reseting` back to
    /// `Running`. A no-op unless the worker is active.
    pub fn reset(&self) {
        let mut data = self.state.lock();
        data = self.state.wait_on_interrupt(data);
        if data.state.is_active() {
            data.state = ThreadState::Reseting;
            self.state.wake();
        }
    }

    /// Quiesce the worker, preserving its current state for `resume`.
    /// Interrupts nest; only the outermost call performs the state flip and
    /// it does not return until the worker reached `Interrupted`.
    pub fn interrupt(&self) {
        let mut data = self.state.lock();
        data.interrupt_depth += 1;
        if data.interrupt_depth > 1 || !data.state.is_active() {
            return;
        }
        data.saved_state = data.state;
        data = self.state.wait_on_interrupt(data);
        data.state = ThreadState::Interrupting;
        self.signals.request_preempt();
        self.state.wake();
        drop(self.wait_until_not_state(data, ThreadState::Interrupting));
    }

    /// Release one level of interrupt; the outermost release restores the
    /// state saved by `interrupt`.
    pub fn resume(&self) {
        let mut data = self.state.lock();
        data.interrupt_depth = data.interrupt_depth.saturating_sub(1);
        if data.interrupt_depth < 1 && data.state.is_active() {
            data.state = data.saved_state;
            self.state.wake();
        }
    }

    /// Pause a running worker and wait until it reached `Paused`. A no-op
    /// in any other state.
    pub fn pause(&self) {
        let mut frame_on = true;
        {
            let mut data = self.state.lock();
            data = self.state.wait_on_interrupt(data);
            if data.state == ThreadState::Running {
                data = self.pause_thread(data, false);
                frame_on = false;
            }
            drop(data);
        }
        self.sync.change_video_sync(frame_on);
    }

    pub fn unpause(&self) {
        {
            let mut data = self.state.lock();
            data = self.state.wait_on_interrupt(data);
            if data.state == ThreadState::Paused || data.state == ThreadState::Pausing {
                data.state = ThreadState::Running;
                self.state.wake();
            }
        }
        self.sync.change_video_sync(true);
    }

    pub fn toggle_pause(&self) {
        let mut frame_on = true;
        {
            let mut data = self.state.lock();
            data = self.state.wait_on_interrupt(data);
            if data.state == ThreadState::Paused || data.state == ThreadState::Pausing {
                data.state = ThreadState::Running;
                self.state.wake();
            } else if data.state == ThreadState::Running {
                data = self.pause_thread(data, false);
                frame_on = false;
            }
            drop(data);
        }
        self.sync.change_video_sync(frame_on);
    }

    /// Pause variant for code already running on the worker (reachable via
    /// [`get_context`](crate::context::get_context)); skips the
    /// wait-for-worker handshake since the worker is the caller.
    pub fn pause_from_thread(&self) {
        let mut frame_on = true;
        {
            let mut data = self.state.lock();
            data = self.state.wait_on_interrupt(data);
            if data.state == ThreadState::Running {
                drop(self.pause_thread(data, true));
                frame_on = false;
            }
        }
        self.sync.change_video_sync(frame_on);
    }

    pub fn state(&self) -> ThreadState {
        self.state.state()
    }

    pub fn has_started(&self) -> bool {
        self.state.lock().state.has_started()
    }

    pub fn has_exited(&self) -> bool {
        self.state.lock().state.has_exited()
    }

    pub fn has_crashed(&self) -> bool {
        self.state.lock().state == ThreadState::Crashed
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().state.is_active()
    }

    pub fn is_paused(&self) -> bool {
        let mut data = self.state.lock();
        data = self.state.wait_on_interrupt(data);
        data.state == ThreadState::Paused
    }

    pub fn interrupt_depth(&self) -> u32 {
        self.state.lock().interrupt_depth
    }

    fn with_resources<F: FnOnce(&mut crate::context::WorkerResources)>(&self, f: F) {
        match self.resources.lock().unwrap().as_mut() {
            Some(resources) => f(resources),
            None => warn!("worker already started, configuration ignored"),
        }
    }
}

/// The supervisor handle the host owns. Dereferences to [`ThreadContext`]
/// for all lifecycle operations and queries.
pub struct EmuThread {
    ctx: Arc<ThreadContext>,
    handle: Option<JoinHandle<()>>,
}

impl std::ops::Deref for EmuThread {
    type Target = ThreadContext;

    fn deref(&self) -> &ThreadContext {
        &self.ctx
    }
}

impl EmuThread {
    pub fn new<F>(core_factory: F) -> EmuThread
    where
        F: FnOnce(&ThreadContext) -> Box<dyn EmuCore> + Send + 'static,
    {
        let ctx = Arc::new(ThreadContext::new());
        if let Some(resources) = ctx.resources.lock().unwrap().as_mut() {
            resources.core_factory = Some(Box::new(core_factory));
        }
        EmuThread { ctx, handle: None }
    }

    pub fn context(&self) -> Arc<ThreadContext> {
        self.ctx.clone()
    }

    pub fn set_renderer(&self, renderer: Box<dyn FrameSink>) {
        self.with_resources(|r| r.renderer = Some(renderer));
    }

    pub fn set_debugger(&self, debugger: Box<dyn Debugger>) {
        self.with_resources(|r| r.debugger = Some(debugger));
    }

    pub fn set_cheats(&self, cheats: Box<dyn CheatDevice>) {
        self.with_resources(|r| r.cheats = Some(cheats));
    }

    pub fn set_movie_factory(&self, factory: MovieFactory) {
        self.with_resources(|r| r.movie_factory = Some(factory));
    }

    pub fn set_overrides(&self, overrides: Vec<GameOverride>) {
        self.with_resources(|r| r.overrides = overrides);
    }

    pub fn set_override(&self, game_override: GameOverride) {
        self.with_resources(|r| r.game_override = Some(game_override));
    }

    pub fn set_start_callback<F: FnOnce(&ThreadContext) + Send + 'static>(&self, cb: F) {
        self.with_resources(|r| r.start_callback = Some(Box::new(cb)));
    }

    pub fn set_clean_callback<F: FnOnce(&ThreadContext) + Send + 'static>(&self, cb: F) {
        self.with_resources(|r| r.clean_callback = Some(Box::new(cb)));
    }

    pub fn set_frame_callback<F: FnMut(&ThreadContext) + Send + 'static>(&self, cb: F) {
        self.with_resources(|r| r.frame_callback = Some(Box::new(cb)));
    }

    /// Hand the context a ROM handle directly, bypassing `map_arguments`.
    pub fn set_rom_file(&self, rom: Box<dyn VFile>) {
        self.ctx.files.lock().unwrap().rom = Some(rom);
    }

    pub fn set_bios_file(&self, bios: Box<dyn VFile>) {
        self.ctx.files.lock().unwrap().bios = Some(bios);
    }

    pub fn set_cheats_file(&self, cheats_file: Box<dyn VFile>) {
        self.ctx.files.lock().unwrap().cheats_file = Some(cheats_file);
    }

    /// Resolve the ROM, spawn the worker and wait for it to publish
    /// `Running`. Fails with `NoRomFound` (state goes to `Shutdown`, no
    /// worker is spawned) when the media scan comes up empty.
    pub fn start(&mut self) -> SupervisorResult<()> {
        if self.handle.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        let ctx = &self.ctx;

        {
            let mut data = ctx.state.lock();
            data.state = ThreadState::Initialized;
            data.saved_state = ThreadState::Initialized;
            data.interrupt_depth = 0;
        }
        ctx.active_keys
            .store(KEYINPUT_ALL_RELEASED, Ordering::Relaxed);

        {
            let mut config = ctx.config.lock().unwrap();
            if config.fps_target == 0.0 {
                config.fps_target = DEFAULT_FPS_TARGET;
            }
            let (capacity, interval) = if config.rewind_enable {
                (config.rewind_buffer_capacity, config.rewind_buffer_interval)
            } else {
                (0, 0)
            };
            ctx.rewind.lock().unwrap().settings_changed(capacity, interval);
            ctx.sync.prepare_start(config.video_sync, config.audio_sync);
        }

        {
            let mut files = ctx.files.lock().unwrap();
            if let Some(rom) = files.rom.as_mut() {
                if !crate::context::is_rom(rom.as_mut()) {
                    warn!("provided file does not look like a GBA ROM, discarding");
                    files.rom = None;
                }
            }
            files.scan_game_dir();
            if files.rom.is_none() {
                drop(files);
                ctx.state.change_state(ThreadState::Shutdown, false);
                return Err(SupervisorError::NoRomFound);
            }
            files.open_save();
        }

        // Keep debugger traps out of the host; the worker restores its own
        // mask on entry.
        block_host_signals();

        let worker_ctx = self.ctx.clone();
        let mut data = ctx.state.lock();
        let handle = Builder::new()
            .name("gba-thread".to_owned())
            .spawn(move || worker::run(worker_ctx))?;
        while data.state < ThreadState::Running {
            data = ctx.state.wait(data);
        }
        drop(data);

        self.handle = Some(handle);
        Ok(())
    }

    /// Join the worker and release every owned resource. The media handles
    /// are closed here and nowhere else.
    pub fn join(&mut self) -> SupervisorResult<()> {
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| SupervisorError::ThreadPanicked)?;
        }
        self.ctx.rewind.lock().unwrap().clear();
        *self.ctx.files.lock().unwrap() = Default::default();
        Ok(())
    }
}

impl Drop for EmuThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.end();
            if let Err(e) = self.join() {
                error!("failed to join emulation worker: {:?}", e);
            }
        }
    }
}

#[cfg(unix)]
fn block_host_signals() {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGINT);
        libc::sigaddset(&mut mask, libc::SIGTRAP);
        libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn block_host_signals() {}
