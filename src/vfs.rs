//! Minimal virtual file layer. Media handed to the supervisor may come from
//! plain files, in-memory buffers or zip archives; the scan and load paths
//! only see these traits.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::Path;

use zip::ZipArchive;

/// A file handle. Closing is dropping.
pub trait VFile: Read + Write + Seek + Send {}

impl VFile for File {}
impl VFile for Cursor<Vec<u8>> {}

/// A listable directory of files.
pub trait VDir: Send {
    fn rewind(&mut self);
    fn list_next(&mut self) -> Option<String>;
    fn open_file(&mut self, name: &str, write: bool) -> Option<Box<dyn VFile>>;
}

pub fn open_file(path: &Path) -> io::Result<Box<dyn VFile>> {
    Ok(Box::new(File::open(path)?))
}

pub fn create_file(path: &Path) -> io::Result<Box<dyn VFile>> {
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    Ok(Box::new(f))
}

pub fn memory_file(data: Vec<u8>) -> Box<dyn VFile> {
    Box::new(Cursor::new(data))
}

/// Open a path as a directory: a real directory, or a zip archive treated
/// as one.
pub fn open_dir(path: &Path) -> Option<Box<dyn VDir>> {
    if path.is_dir() {
        match FsDir::open(path) {
            Ok(dir) => Some(Box::new(dir)),
            Err(e) => {
                warn!("could not open directory {:?}: {}", path, e);
                None
            }
        }
    } else {
        ZipDir::open(path)
            .ok()
            .map(|dir| Box::new(dir) as Box<dyn VDir>)
    }
}

pub struct FsDir {
    path: std::path::PathBuf,
    entries: Vec<String>,
    cursor: usize,
}

impl FsDir {
    pub fn open(path: &Path) -> io::Result<FsDir> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    entries.push(name);
                }
            }
        }
        entries.sort();
        Ok(FsDir {
            path: path.to_path_buf(),
            entries,
            cursor: 0,
        })
    }
}

impl VDir for FsDir {
    fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn list_next(&mut self) -> Option<String> {
        let name = self.entries.get(self.cursor).cloned();
        self.cursor += 1;
        name
    }

    fn open_file(&mut self, name: &str, write: bool) -> Option<Box<dyn VFile>> {
        let path = self.path.join(name);
        if write {
            create_file(&path).ok()
        } else {
            open_file(&path).ok()
        }
    }
}

/// Zip archive presented as a read-only directory. Entries are decompressed
/// into memory on open.
pub struct ZipDir {
    archive: ZipArchive<Cursor<Vec<u8>>>,
    cursor: usize,
}

impl ZipDir {
    pub fn open(path: &Path) -> io::Result<ZipDir> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        ZipDir::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> io::Result<ZipDir> {
        let archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
        Ok(ZipDir { archive, cursor: 0 })
    }
}

impl VDir for ZipDir {
    fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn list_next(&mut self) -> Option<String> {
        if self.cursor >= self.archive.len() {
            return None;
        }
        let name = self
            .archive
            .by_index(self.cursor)
            .ok()
            .map(|f| f.name().to_owned());
        self.cursor += 1;
        name
    }

    fn open_file(&mut self, name: &str, write: bool) -> Option<Box<dyn VFile>> {
        if write {
            return None;
        }
        let mut file = self.archive.by_name(name).ok()?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).ok()?;
        Some(memory_file(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_zip_dir_listing_and_open() {
        let bytes = make_zip(&[("game.gba", b"AAAA"), ("notes.txt", b"hello")]);
        let mut dir = ZipDir::from_bytes(bytes).unwrap();

        let mut names = Vec::new();
        while let Some(name) = dir.list_next() {
            names.push(name);
        }
        assert_eq!(names, vec!["game.gba", "notes.txt"]);

        dir.rewind();
        assert_eq!(dir.list_next().as_deref(), Some("game.gba"));

        let mut vf = dir.open_file("notes.txt", false).unwrap();
        let mut buf = Vec::new();
        vf.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");

        assert!(dir.open_file("notes.txt", true).is_none());
        assert!(dir.open_file("missing", false).is_none());
    }

    #[test]
    fn test_memory_file_round_trip() {
        let mut vf = memory_file(vec![1, 2, 3]);
        let mut buf = Vec::new();
        vf.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![1, 2, 3]);
    }
}
