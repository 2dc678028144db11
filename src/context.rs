//! Per-worker context: lifecycle state, the sync channel, configuration,
//! owned media handles and the one-shot resources handed to the worker.

use std::cell::RefCell;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::interface::{
    CheatDevice, CoreFactory, CoreSignals, Debugger, FrameCallback, FrameSink, GameOverride,
    LifecycleCallback, MovieFactory,
};
use crate::keypad::{self, KeySource};
use crate::state::StateChannel;
use crate::sync::SyncChannel;
use crate::vfs::{self, VDir, VFile};

pub const DEFAULT_FPS_TARGET: f32 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, SmartDefault)]
pub enum IdleOptimization {
    Ignore,
    #[default]
    Remove,
    Detect,
}

/// Options consumed during start.
#[derive(Debug, Clone, SmartDefault)]
pub struct Config {
    pub bios: Option<PathBuf>,
    pub frameskip: i32,
    #[default(log::LevelFilter::Info)]
    pub log_level: log::LevelFilter,
    pub rewind_enable: bool,
    pub rewind_buffer_capacity: usize,
    pub rewind_buffer_interval: usize,
    pub skip_bios: bool,
    /// Producer blocks when the sample buffer is full.
    #[default = true]
    pub audio_sync: bool,
    /// Producer blocks for each frame to be claimed.
    pub video_sync: bool,
    #[default(DEFAULT_FPS_TARGET)]
    pub fps_target: f32,
    /// Sample buffer size; 0 picks the default.
    pub audio_buffers: usize,
    pub idle_optimization: IdleOptimization,
}

/// Command-line style inputs.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    pub fname: Option<PathBuf>,
    /// Treat `fname` as a game directory instead of a single ROM.
    pub dirmode: bool,
    pub patch: Option<PathBuf>,
    pub cheats_file: Option<PathBuf>,
    pub movie: Option<PathBuf>,
}

/// Media handles owned by the context. Everything here is closed by
/// `EmuThread::join`, nothing earlier.
#[derive(Default)]
pub(crate) struct FileSet {
    pub rom: Option<Box<dyn VFile>>,
    pub bios: Option<Box<dyn VFile>>,
    pub save: Option<Box<dyn VFile>>,
    pub patch: Option<Box<dyn VFile>>,
    pub cheats_file: Option<Box<dyn VFile>>,
    pub game_dir: Option<Box<dyn VDir>>,
    /// Saves live inside the game directory (dir mode).
    pub state_in_game_dir: bool,
    pub fname: Option<PathBuf>,
    pub movie: Option<PathBuf>,
}

impl FileSet {
    /// Resolve the save file next to the ROM: inside the state directory in
    /// dir mode, else the ROM path with a `.sav` extension.
    pub fn open_save(&mut self) {
        if self.save.is_some() {
            return;
        }
        let stem = match self
            .fname
            .as_ref()
            .and_then(|p| p.file_stem())
            .and_then(|s| s.to_str())
        {
            Some(stem) => stem.to_owned(),
            None => return,
        };
        if self.state_in_game_dir {
            if let Some(dir) = self.game_dir.as_mut() {
                self.save = dir.open_file(&format!("{}.sav", stem), true);
            }
        } else if let Some(fname) = &self.fname {
            match vfs::create_file(&fname.with_extension("sav")) {
                Ok(vf) => self.save = Some(vf),
                Err(e) => warn!("could not open save file: {}", e),
            }
        }
    }

    /// Claim the first ROM and the first patch found in the game directory,
    /// closing everything else.
    pub fn scan_game_dir(&mut self) {
        let dir = match self.game_dir.as_mut() {
            Some(dir) => dir,
            None => return,
        };
        dir.rewind();
        while let Some(name) = dir.list_next() {
            let mut vf = match dir.open_file(&name, false) {
                Some(vf) => vf,
                None => continue,
            };
            if self.rom.is_none() && is_rom(vf.as_mut()) {
                info!("found ROM in game directory: {}", name);
                self.rom = Some(vf);
            } else if self.patch.is_none() && is_patch(vf.as_mut()) {
                info!("found patch in game directory: {}", name);
                self.patch = Some(vf);
            }
        }
    }
}

/// Collaborators and hooks consumed once by the worker on entry.
#[derive(Default)]
pub(crate) struct WorkerResources {
    pub core_factory: Option<CoreFactory>,
    pub renderer: Option<Box<dyn FrameSink>>,
    pub debugger: Option<Box<dyn Debugger>>,
    pub cheats: Option<Box<dyn CheatDevice>>,
    pub movie_factory: Option<MovieFactory>,
    pub overrides: Vec<GameOverride>,
    pub game_override: Option<GameOverride>,
    pub start_callback: Option<LifecycleCallback>,
    pub clean_callback: Option<LifecycleCallback>,
    pub frame_callback: Option<FrameCallback>,
}

/// Retained rewind savestates. The states themselves are produced elsewhere;
/// the supervisor owns the storage and its lifecycle.
#[derive(Default)]
pub(crate) struct RewindBuffer {
    pub states: Vec<Option<Box<[u8]>>>,
    pub capacity: usize,
    pub interval: usize,
}

impl RewindBuffer {
    pub fn settings_changed(&mut self, capacity: usize, interval: usize) {
        self.interval = interval;
        if capacity != self.capacity {
            self.states = (0..capacity).map(|_| None).collect();
            self.capacity = capacity;
        }
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.capacity = 0;
        self.interval = 0;
    }
}

pub struct ThreadContext {
    pub(crate) state: StateChannel,
    pub sync: Arc<SyncChannel>,
    pub signals: Arc<CoreSignals>,
    /// Live key state; the worker hands a clone to the core.
    pub active_keys: KeySource,
    pub(crate) config: Mutex<Config>,
    pub(crate) files: Mutex<FileSet>,
    pub(crate) rewind: Mutex<RewindBuffer>,
    pub(crate) resources: Mutex<Option<WorkerResources>>,
}

impl ThreadContext {
    pub(crate) fn new() -> ThreadContext {
        ThreadContext {
            state: StateChannel::new(),
            sync: Arc::new(SyncChannel::new()),
            signals: Arc::new(CoreSignals::default()),
            active_keys: keypad::new_key_source(),
            config: Mutex::new(Config::default()),
            files: Mutex::new(FileSet::default()),
            rewind: Mutex::new(RewindBuffer::default()),
            resources: Mutex::new(Some(WorkerResources::default())),
        }
    }

    /// Snapshot of the owned option set, for core factories and callbacks.
    pub fn config(&self) -> Config {
        self.config.lock().unwrap().clone()
    }

    /// Copy the option set into the context and open the BIOS handle.
    pub fn map_options(&self, opts: &Config) {
        if let Some(bios) = &opts.bios {
            match vfs::open_file(bios) {
                Ok(vf) => self.files.lock().unwrap().bios = Some(vf),
                Err(e) => warn!("could not open bios {:?}: {}", bios, e),
            }
        }
        *self.config.lock().unwrap() = opts.clone();
    }

    /// Open the media named by the arguments. A missing ROM is only an
    /// error at start, after the directory scan had its chance.
    pub fn map_arguments(&self, args: &Arguments) {
        let mut files = self.files.lock().unwrap();
        if args.dirmode {
            if let Some(fname) = &args.fname {
                files.game_dir = vfs::open_dir(fname);
                files.state_in_game_dir = files.game_dir.is_some();
            }
        } else if let Some(fname) = &args.fname {
            match vfs::open_file(fname) {
                Ok(vf) => files.rom = Some(vf),
                Err(e) => warn!("could not open rom {:?}: {}", fname, e),
            }
            // A zipped ROM opens as a game directory instead.
            if files.game_dir.is_none() && !fname.is_dir() {
                if let Ok(dir) = vfs::ZipDir::open(fname) {
                    files.game_dir = Some(Box::new(dir));
                }
            }
        }
        files.fname = args.fname.clone();
        if let Some(path) = &args.patch {
            files.patch = vfs::open_file(path).ok();
        }
        if let Some(path) = &args.cheats_file {
            files.cheats_file = vfs::open_file(path).ok();
        }
        files.movie = args.movie.clone();
    }
}

/// GBA cartridge header probe: a full 192-byte header with the fixed value
/// 0x96 at offset 0xB2.
pub(crate) fn is_rom(vf: &mut dyn VFile) -> bool {
    let mut fixed = [0u8; 1];
    let looks_like_rom = vf
        .seek(SeekFrom::End(0))
        .map(|size| size >= 0xc0)
        .unwrap_or(false)
        && vf.seek(SeekFrom::Start(0xb2)).is_ok()
        && vf.read_exact(&mut fixed).is_ok()
        && fixed[0] == 0x96;
    let _ = vf.seek(SeekFrom::Start(0));
    looks_like_rom
}

/// IPS / UPS / BPS patch magic probe.
pub(crate) fn is_patch(vf: &mut dyn VFile) -> bool {
    let mut magic = [0u8; 5];
    let looks_like_patch = vf.seek(SeekFrom::Start(0)).is_ok()
        && vf.read_exact(&mut magic).is_ok()
        && (&magic == b"PATCH" || &magic[..4] == b"UPS1" || &magic[..4] == b"BPS1");
    let _ = vf.seek(SeekFrom::Start(0));
    looks_like_patch
}

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Arc<ThreadContext>>> = RefCell::new(None);
}

/// The context associated with the calling thread. Set for the lifetime of
/// the worker's execution; any other thread sees `None`.
pub fn get_context() -> Option<Arc<ThreadContext>> {
    CURRENT_CONTEXT.with(|slot| slot.borrow().clone())
}

pub(crate) struct ContextSlot;

pub(crate) fn install_context(ctx: Arc<ThreadContext>) -> ContextSlot {
    CURRENT_CONTEXT.with(|slot| *slot.borrow_mut() = Some(ctx));
    ContextSlot
}

impl Drop for ContextSlot {
    fn drop(&mut self) {
        CURRENT_CONTEXT.with(|slot| slot.borrow_mut().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom_image() -> Vec<u8> {
        let mut rom = vec![0u8; 0xc0];
        rom[0xb2] = 0x96;
        rom
    }

    struct MemDir {
        entries: Vec<(String, Vec<u8>)>,
        cursor: usize,
    }

    impl VDir for MemDir {
        fn rewind(&mut self) {
            self.cursor = 0;
        }

        fn list_next(&mut self) -> Option<String> {
            let name = self.entries.get(self.cursor).map(|(n, _)| n.clone());
            self.cursor += 1;
            name
        }

        fn open_file(&mut self, name: &str, _write: bool) -> Option<Box<dyn VFile>> {
            self.entries
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, data)| vfs::memory_file(data.clone()))
        }
    }

    #[test]
    fn test_rom_probe() {
        assert!(is_rom(vfs::memory_file(rom_image()).as_mut()));
        assert!(!is_rom(vfs::memory_file(vec![0u8; 0xc0]).as_mut()));
        assert!(!is_rom(vfs::memory_file(vec![0x96; 16]).as_mut()));
    }

    #[test]
    fn test_patch_probe() {
        assert!(is_patch(vfs::memory_file(b"PATCH....".to_vec()).as_mut()));
        assert!(is_patch(vfs::memory_file(b"UPS1..".to_vec()).as_mut()));
        assert!(!is_patch(vfs::memory_file(b"GARBAGE".to_vec()).as_mut()));
    }

    #[test]
    fn test_game_dir_scan_claims_rom_and_patch() {
        let mut files = FileSet::default();
        files.game_dir = Some(Box::new(MemDir {
            entries: vec![
                ("readme.txt".to_owned(), b"hi".to_vec()),
                ("game.gba".to_owned(), rom_image()),
                ("fix.ips".to_owned(), b"PATCH....".to_vec()),
                ("other.gba".to_owned(), rom_image()),
            ],
            cursor: 0,
        }));
        files.scan_game_dir();
        assert!(files.rom.is_some());
        assert!(files.patch.is_some());
    }

    #[test]
    fn test_rewind_settings() {
        let mut rewind = RewindBuffer::default();
        rewind.settings_changed(4, 30);
        assert_eq!(rewind.states.len(), 4);
        assert_eq!(rewind.interval, 30);
        rewind.settings_changed(4, 10);
        assert_eq!(rewind.interval, 10);
        rewind.clear();
        assert_eq!(rewind.capacity, 0);
        assert!(rewind.states.is_empty());
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.fps_target, DEFAULT_FPS_TARGET);
        assert!(config.audio_sync);
        assert!(!config.video_sync);
        assert_eq!(config.idle_optimization, IdleOptimization::Remove);
    }
}
