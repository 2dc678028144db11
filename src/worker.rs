//! The emulation worker: setup, main loop, worker-side state machine poll,
//! teardown. Everything in this module runs on the spawned thread.

use std::sync::Arc;

use crate::audio;
use crate::context::{install_context, ThreadContext, WorkerResources};
use crate::interface::{CoreStatus, DebuggerState, EmuCore, EnterReason, Movie};
use crate::state::ThreadState;
use crate::vfs;
use crate::vfs::VFile;
use crate::SupervisorResult;

pub(crate) fn run(ctx: Arc<ThreadContext>) {
    let _slot = install_context(ctx.clone());
    clear_signal_mask();
    info!("emulation worker starting");

    let mut resources = ctx
        .resources
        .lock()
        .unwrap()
        .take()
        .expect("worker resources already taken");

    log::set_max_level(ctx.config.lock().unwrap().log_level);

    let mut movie = None;
    match setup(&ctx, &mut resources, &mut movie) {
        Ok(mut core) => {
            if let Some(cb) = resources.start_callback.take() {
                cb(&ctx);
            }
            ctx.state.change_state(ThreadState::Running, true);
            main_loop(&ctx, core.as_mut(), &mut resources);
            teardown(&ctx, Some(core), movie, &mut resources);
        }
        Err(e) => {
            // Not recoverable past this point; drain straight to shutdown.
            error!("worker setup failed: {:?}", e);
            ctx.state.change_state(ThreadState::Exiting, true);
            teardown(&ctx, None, movie, &mut resources);
        }
    }
}

/// Construct the core and wire up every collaborator the context carries.
fn setup(
    ctx: &ThreadContext,
    resources: &mut WorkerResources,
    movie: &mut Option<Box<dyn Movie>>,
) -> SupervisorResult<Box<dyn EmuCore>> {
    let factory = resources
        .core_factory
        .take()
        .ok_or(crate::SupervisorError::NoCoreFactory)?;
    let mut core = factory(ctx);
    core.connect_sync(ctx.sync.clone());
    core.set_key_source(ctx.active_keys.clone());

    let (audio_buffers, skip_bios) = {
        let config = ctx.config.lock().unwrap();
        (config.audio_buffers, config.skip_bios)
    };
    let audio_samples = audio::resolve_samples(audio_buffers);
    core.resize_audio_buffer(audio_samples);
    ctx.config.lock().unwrap().audio_buffers = audio_samples;

    if let Some(mut renderer) = resources.renderer.take() {
        renderer.associate(ctx.sync.clone());
        core.set_renderer(renderer);
    }

    {
        let mut files = ctx.files.lock().unwrap();
        let files = &mut *files;
        let save: Option<&mut dyn VFile> =
            files.save.as_mut().map(|b| &mut **b as &mut dyn VFile);
        if let Some(rom) = files.rom.as_mut() {
            let fname = files.fname.as_ref().and_then(|p| p.to_str());
            core.load_rom(rom.as_mut(), save, fname)?;

            if let Some(code) = core.game_code() {
                if let Some(ov) = resources.overrides.iter().find(|ov| ov.game_code == code) {
                    info!("applying override for {}", code);
                    core.apply_override(ov);
                }
            }
            if let Some(ov) = &resources.game_override {
                core.apply_override(ov);
            }

            if let Some(bios) = files.bios.as_mut() {
                core.load_bios(bios.as_mut())?;
            }
            if let Some(patch) = files.patch.as_mut() {
                if let Err(e) = core.apply_patch(patch.as_mut()) {
                    warn!("failed to apply patch: {:?}", e);
                }
            }
        }
    }

    let movie_path = ctx.files.lock().unwrap().movie.clone();
    if let Some(path) = movie_path {
        if let Some(factory) = resources.movie_factory.take() {
            match vfs::open_dir(&path) {
                Some(dir) => *movie = factory(dir),
                None => warn!("could not open movie {:?}", path),
            }
        }
    }

    core.reset();

    if let Some(movie) = movie.as_mut() {
        movie.start_playing(false);
    }

    if skip_bios {
        core.skip_bios();
    }

    if let Some(mut cheats) = resources.cheats.take() {
        if let Some(vf) = ctx.files.lock().unwrap().cheats_file.as_mut() {
            if let Err(e) = cheats.parse_file(vf.as_mut()) {
                warn!("failed to parse cheats file: {:?}", e);
            }
        }
        core.attach_cheats(cheats);
    }

    if let Some(debugger) = resources.debugger.as_mut() {
        debugger.enter(EnterReason::Attached);
    }

    Ok(core)
}

fn main_loop(ctx: &ThreadContext, core: &mut dyn EmuCore, resources: &mut WorkerResources) {
    let skip_bios = ctx.config.lock().unwrap().skip_bios;

    while ctx.state.state() < ThreadState::Exiting {
        if let Some(debugger) = resources.debugger.as_mut() {
            debugger.run(core);
            if debugger.state() == DebuggerState::Shutdown {
                ctx.state.change_state(ThreadState::Exiting, false);
            }
        } else {
            while ctx.state.state() == ThreadState::Running {
                match core.run_quantum() {
                    CoreStatus::Ok => {}
                    CoreStatus::FrameCompleted => {
                        if let Some(cb) = resources.frame_callback.as_mut() {
                            cb(ctx);
                        }
                    }
                    CoreStatus::Crashed => {
                        error!("emulation core crashed");
                        ctx.state.change_state(ThreadState::Crashed, true);
                    }
                }
            }
        }
        ctx.signals.take_preempt();

        let mut reset_scheduled = false;
        {
            let mut data = ctx.state.lock();
            while data.state > ThreadState::Running && data.state < ThreadState::Exiting {
                match data.state {
                    ThreadState::Pausing => {
                        data.state = ThreadState::Paused;
                        ctx.state.wake();
                    }
                    ThreadState::Interrupting => {
                        data.state = ThreadState::Interrupted;
                        ctx.state.wake();
                    }
                    ThreadState::Reseting => {
                        data.state = ThreadState::Running;
                        reset_scheduled = true;
                    }
                    _ => {}
                }
                while data.state == ThreadState::Paused || data.state == ThreadState::Interrupted {
                    data = ctx.state.wait(data);
                }
            }
        }
        if reset_scheduled {
            debug!("performing scheduled reset");
            core.reset();
            if skip_bios {
                core.skip_bios();
            }
        }
    }
}

fn teardown(
    ctx: &ThreadContext,
    core: Option<Box<dyn EmuCore>>,
    movie: Option<Box<dyn Movie>>,
    resources: &mut WorkerResources,
) {
    {
        let mut data = ctx.state.lock();
        if data.state < ThreadState::Shutdown {
            data.state = ThreadState::Shutdown;
        }
    }

    if let Some(cb) = resources.clean_callback.take() {
        cb(ctx);
    }

    drop(core);
    drop(movie);

    ctx.sync.teardown_wakeup();
    info!("emulation worker terminated");
}

#[cfg(unix)]
fn clear_signal_mask() {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::pthread_sigmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn clear_signal_mask() {}
