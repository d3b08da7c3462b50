//! Flat file storage behind the BDOS.
//!
//! A drive maps upper-case 8.3 names to byte blobs. There is no disk
//! geometry: a file is read and written in 128 byte records by offset.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

pub const RECORD_SIZE: usize = 128;
pub const NAME_LEN: usize = 8;
pub const EXT_LEN: usize = 3;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("disk I/O error: {0}")]
    Io(#[from] io::Error),
}

pub trait Drive: Send {
    fn get_file(&self, name: &str) -> Option<&[u8]>;
    fn save_file(&mut self, name: &str, data: Vec<u8>) -> Result<(), DiskError>;
    fn delete_file(&mut self, name: &str) -> Result<(), DiskError>;
    fn rename_file(&mut self, old_name: &str, new_name: &str) -> Result<(), DiskError>;

    /// All file names on the drive, sorted.
    fn list_files(&self) -> Vec<String>;

    fn contains(&self, name: &str) -> bool {
        self.get_file(name).is_some()
    }
}

/// Upper-case a file name and check it can live on a drive.
pub fn normalize_name(name: &str) -> Result<String, DiskError> {
    let trimmed = name.trim();
    let invalid = trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.chars().any(|c| c == '/' || c == '\\' || c == ':' || c.is_control());
    if invalid {
        return Err(DiskError::InvalidName(name.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// True when the name fits the 8.3 form an FCB can hold.
pub fn is_short_name(name: &str) -> bool {
    let (base, ext) = name.split_once('.').unwrap_or((name, ""));
    !base.is_empty()
        && base.len() <= NAME_LEN
        && ext.len() <= EXT_LEN
        && !ext.contains('.')
        && name.bytes().all(|c| c.is_ascii_graphic() && c != b'*' && c != b'?')
}

/// Build the 11 byte padded name/extension form used in an FCB.
///
/// A `*` fills the rest of its field with `?`. Overlong parts are cut.
pub fn fcb_name(name: &str) -> [u8; NAME_LEN + EXT_LEN] {
    let upper = name.trim().to_ascii_uppercase();
    let (base, ext) = match upper.rsplit_once('.') {
        Some((base, ext)) => (base.to_string(), ext.to_string()),
        None => (upper.clone(), String::new()),
    };

    let mut raw = [b' '; NAME_LEN + EXT_LEN];
    fill_field(&mut raw[..NAME_LEN], base.as_bytes());
    fill_field(&mut raw[NAME_LEN..], ext.as_bytes());
    raw
}

fn fill_field(field: &mut [u8], part: &[u8]) {
    for i in 0..field.len() {
        match part.get(i) {
            Some(b'*') => {
                field[i..].fill(b'?');
                return;
            }
            Some(&c) => field[i] = c,
            None => return,
        }
    }
}

/// Turn an 11 byte FCB name back into `NAME.EXT`.
///
/// The high bit of every byte is attribute data and is masked off.
pub fn name_from_fcb(raw: &[u8]) -> String {
    let clean = |bytes: &[u8]| -> String {
        bytes
            .iter()
            .map(|b| (b & 0x7F) as char)
            .collect::<String>()
            .trim_end()
            .to_string()
    };

    let base = clean(&raw[..NAME_LEN.min(raw.len())]);
    let ext = if raw.len() > NAME_LEN {
        clean(&raw[NAME_LEN..raw.len().min(NAME_LEN + EXT_LEN)])
    } else {
        String::new()
    };

    if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}

/// Case-insensitive match of a file name against a pattern with `?` and `*`.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    let name = fcb_name(name);
    let pattern = fcb_name(pattern);
    name.iter().zip(pattern.iter()).all(|(&n, &p)| p == b'?' || p == n)
}

/// Drive held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryDrive {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Drive for MemoryDrive {
    fn get_file(&self, name: &str) -> Option<&[u8]> {
        let name = normalize_name(name).ok()?;
        self.files.get(&name).map(|data| data.as_slice())
    }

    fn save_file(&mut self, name: &str, data: Vec<u8>) -> Result<(), DiskError> {
        let name = normalize_name(name)?;
        self.files.insert(name, data);
        Ok(())
    }

    fn delete_file(&mut self, name: &str) -> Result<(), DiskError> {
        let name = normalize_name(name)?;
        match self.files.remove(&name) {
            Some(_) => Ok(()),
            None => Err(DiskError::NotFound(name)),
        }
    }

    fn rename_file(&mut self, old_name: &str, new_name: &str) -> Result<(), DiskError> {
        let old_name = normalize_name(old_name)?;
        let new_name = normalize_name(new_name)?;
        if self.files.contains_key(&new_name) {
            return Err(DiskError::AlreadyExists(new_name));
        }
        let data = self
            .files
            .remove(&old_name)
            .ok_or(DiskError::NotFound(old_name))?;
        self.files.insert(new_name, data);
        Ok(())
    }

    fn list_files(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}

/// Drive backed by a host directory.
///
/// The directory is read once when the drive is opened; every change is
/// written through to the host.
#[derive(Debug)]
pub struct DirectoryDrive {
    root: PathBuf,
    cache: MemoryDrive,
    host_paths: HashMap<String, PathBuf>,
}

impl DirectoryDrive {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, DiskError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut cache = MemoryDrive::new();
        let mut host_paths = HashMap::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let name = match normalize_name(&file_name) {
                Ok(name) if is_short_name(&name) => name,
                _ => {
                    debug!("skipping host file {}", file_name);
                    continue;
                }
            };
            let data = fs::read(entry.path())?;
            cache.save_file(&name, data)?;
            host_paths.insert(name, entry.path());
        }

        info!("opened drive at {} with {} files", root.display(), host_paths.len());
        Ok(DirectoryDrive { root, cache, host_paths })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, name: &str) -> PathBuf {
        self.host_paths
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.root.join(name))
    }
}

impl Drive for DirectoryDrive {
    fn get_file(&self, name: &str) -> Option<&[u8]> {
        self.cache.get_file(name)
    }

    fn save_file(&mut self, name: &str, data: Vec<u8>) -> Result<(), DiskError> {
        let name = normalize_name(name)?;
        let path = self.host_path(&name);
        fs::write(&path, &data)?;
        debug!("wrote {} ({} bytes)", path.display(), data.len());

        self.cache.save_file(&name, data)?;
        self.host_paths.insert(name, path);
        Ok(())
    }

    fn delete_file(&mut self, name: &str) -> Result<(), DiskError> {
        let name = normalize_name(name)?;
        self.cache.delete_file(&name)?;
        if let Some(path) = self.host_paths.remove(&name) {
            match fs::remove_file(&path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                _ => {}
            }
        }
        Ok(())
    }

    fn rename_file(&mut self, old_name: &str, new_name: &str) -> Result<(), DiskError> {
        let old_name = normalize_name(old_name)?;
        let new_name = normalize_name(new_name)?;
        if !self.cache.contains(&old_name) {
            return Err(DiskError::NotFound(old_name));
        }
        if self.cache.contains(&new_name) {
            return Err(DiskError::AlreadyExists(new_name));
        }

        let from = self.host_path(&old_name);
        let to = self.root.join(&new_name);
        fs::rename(&from, &to)?;

        self.cache.rename_file(&old_name, &new_name)?;
        self.host_paths.remove(&old_name);
        self.host_paths.insert(new_name, to);
        Ok(())
    }

    fn list_files(&self) -> Vec<String> {
        self.cache.list_files()
    }
}
