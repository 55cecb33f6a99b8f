//! File-backed store
//!
//! One file per key under a flat root directory, filename = hex of the
//! key's UTF-8 bytes. Hex survives every key the core produces (`:`, `/`,
//! UUIDs, branch names with path separators) on every filesystem, and
//! `keys()` is a plain directory listing.
//!
//! Writes go through a temp file + rename so a crash mid-write never
//! leaves a torn value behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ProximumError, Result};

use super::{decode_key, encode_key, KvStore};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path, op: &'static str) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| ProximumError::io(op, e))?;
        Ok(FileStore {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(encode_key(key))
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProximumError::io("store.get", e)),
        }
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| ProximumError::io("store.put", e))?;
        file.write_all(&value)
            .map_err(|e| ProximumError::io("store.put", e))?;
        file.sync_all()
            .map_err(|e| ProximumError::io("store.put", e))?;
        fs::rename(&tmp, &path).map_err(|e| ProximumError::io("store.put", e))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProximumError::io("store.delete", e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let entries =
            fs::read_dir(&self.root).map_err(|e| ProximumError::io("store.keys", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| ProximumError::io("store.keys", e))?;
            if let Some(name) = entry.file_name().to_str() {
                // Skip temp files and anything that isn't one of ours
                if let Some(key) = decode_key(name) {
                    out.push(key);
                }
            }
        }
        Ok(out)
    }
}
