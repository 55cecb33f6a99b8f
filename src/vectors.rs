//! Vector storage
//!
//! The read path is a memory-mapped contiguous float region: a 64-byte
//! header followed by `dim * 4`-byte little-endian payloads, so the
//! vector for node `i` is a zero-copy `&[f32]` at `64 + i * dim * 4`.
//! The durable path is chunked: every `chunk_size` appends, the buffered
//! chunk goes to the KV store asynchronously, keyed by a fresh UUID (or a
//! SHA-512-derived content hash in crypto mode, which makes identical
//! chunks deduplicate).
//!
//! ## File Format (Version 1)
//!
//! ```text
//! HEADER (64 bytes):
//!   [magic "PVDB" 4B]
//!   [version u32 LE]
//!   [count u64 LE]       — updated at flush, not per append
//!   [dim u64 LE]
//!   [chunk_size u64 LE]
//!   [reserved 32B]
//!
//! PAYLOAD:
//!   vector i at byte 64 + i * dim * 4, f32 LE
//! ```
//!
//! Forks never touch the shared file: a forked store maps the parent's
//! file read-only and keeps its own appends in an in-memory overlay.
//! Slots below the fork point are immutable once appended, so sharing
//! the mapping is safe; the overlay becomes file bytes only when the
//! fork is materialized into its own branch file.

#[cfg(not(target_endian = "little"))]
compile_error!("the vector mmap format requires a little-endian host");

use memmap2::{Mmap, MmapMut};
use sha2::{Digest, Sha512};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::DistanceKind;
use crate::distance::distance;
use crate::error::{ProximumError, Result};
use crate::store::{PendingWrite, WritePool};

pub const MAGIC: &[u8; 4] = b"PVDB";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 64;

/// Derive a 16-byte chunk address from content (crypto mode).
pub(crate) fn chunk_address(bytes: &[u8]) -> Uuid {
    let digest = Sha512::digest(bytes);
    let mut addr = [0u8; 16];
    addr.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(addr)
}

enum Backing {
    /// Writable mapping of this branch's own file.
    File {
        file: File,
        path: PathBuf,
        map: MmapMut,
    },
    /// Read-only mapping of a file owned by another index (forks,
    /// time-travel loads). Appends go to the overlay.
    FileRo { path: PathBuf, map: Mmap },
    /// Anonymous memory for store-less scratch indices.
    Anon { map: MmapMut },
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::File { map, .. } => map,
            Backing::FileRo { map, .. } => map,
            Backing::Anon { map } => map,
        }
    }

    fn path(&self) -> Option<&Path> {
        match self {
            Backing::File { path, .. } => Some(path),
            Backing::FileRo { path, .. } => Some(path),
            Backing::Anon { .. } => None,
        }
    }
}

pub struct VectorStore {
    backing: Backing,
    dim: usize,
    chunk_size: usize,
    /// Total vectors, overlay included.
    count: usize,
    /// Vectors `0..region_rows` live in the mapped region; the rest in
    /// the overlay. Equal to `count` except on a fork.
    region_rows: usize,
    overlay: Vec<f32>,
    /// Count as of the last KV flush; chunks at or past
    /// `flushed_upto / chunk_size` must be (re)written next flush.
    flushed_upto: usize,
}

fn payload_offset(i: usize, dim: usize) -> usize {
    HEADER_SIZE + i * dim * 4
}

fn write_header(buf: &mut [u8], count: u64, dim: u64, chunk_size: u64) {
    buf[0..4].copy_from_slice(MAGIC);
    buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&count.to_le_bytes());
    buf[16..24].copy_from_slice(&dim.to_le_bytes());
    buf[24..32].copy_from_slice(&chunk_size.to_le_bytes());
    buf[32..HEADER_SIZE].fill(0);
}

/// Parsed header fields.
pub struct Header {
    pub count: u64,
    pub dim: u64,
    pub chunk_size: u64,
}

fn read_header(bytes: &[u8], op: &'static str) -> Result<Header> {
    if bytes.len() < HEADER_SIZE || &bytes[0..4] != MAGIC {
        return Err(ProximumError::io(
            op,
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad vector file magic"),
        ));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().expect("header slice"));
    if version != VERSION {
        return Err(ProximumError::io(
            op,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported vector file version {version}"),
            ),
        ));
    }
    Ok(Header {
        count: u64::from_le_bytes(bytes[8..16].try_into().expect("header slice")),
        dim: u64::from_le_bytes(bytes[16..24].try_into().expect("header slice")),
        chunk_size: u64::from_le_bytes(bytes[24..32].try_into().expect("header slice")),
    })
}

/// Copy a file with reflink when the filesystem supports it, detected at
/// runtime; falls back to a byte copy.
pub fn reflink_or_copy(src: &Path, dst: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;
        if let (Ok(src_file), Ok(dst_file)) = (File::open(src), File::create(dst)) {
            let rc = unsafe {
                libc::ioctl(
                    dst_file.as_raw_fd(),
                    libc::FICLONE as libc::c_ulong,
                    src_file.as_raw_fd(),
                )
            };
            if rc == 0 {
                tracing::debug!(src = %src.display(), dst = %dst.display(), "reflinked branch file");
                return Ok(());
            }
            // Not supported on this filesystem; fall through to byte copy
            let _ = fs::remove_file(dst);
        }
    }
    fs::copy(src, dst).map_err(|e| ProximumError::io("vectors.fork_for_branch", e))?;
    tracing::debug!(src = %src.display(), dst = %dst.display(), "byte-copied branch file");
    Ok(())
}

impl VectorStore {
    /// Create a fresh store. With a path, the branch file is created on
    /// disk; without one, the region is anonymous memory.
    pub fn create(path: Option<&Path>, dim: usize, chunk_size: usize) -> Result<Self> {
        let initial = payload_offset(chunk_size.max(16), dim);
        let backing = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| ProximumError::io("vectors.create", e))?;
                }
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| ProximumError::io("vectors.create", e))?;
                file.set_len(initial as u64)
                    .map_err(|e| ProximumError::io("vectors.create", e))?;
                let mut map = unsafe { MmapMut::map_mut(&file) }
                    .map_err(|e| ProximumError::io("vectors.create", e))?;
                write_header(&mut map, 0, dim as u64, chunk_size as u64);
                Backing::File {
                    file,
                    path: path.to_path_buf(),
                    map,
                }
            }
            None => {
                let mut map = MmapMut::map_anon(initial)
                    .map_err(|e| ProximumError::io("vectors.create", e))?;
                write_header(&mut map, 0, dim as u64, chunk_size as u64);
                Backing::Anon { map }
            }
        };
        Ok(VectorStore {
            backing,
            dim,
            chunk_size,
            count: 0,
            region_rows: 0,
            overlay: Vec::new(),
            flushed_upto: 0,
        })
    }

    /// Open an existing branch file writable, trusting its header count.
    pub fn open(path: &Path, dim: usize, chunk_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ProximumError::io("vectors.open", e))?;
        let map =
            unsafe { MmapMut::map_mut(&file) }.map_err(|e| ProximumError::io("vectors.open", e))?;
        let header = read_header(&map, "vectors.open")?;
        if header.dim != dim as u64 {
            return Err(ProximumError::DimensionMismatch {
                op: "vectors.open",
                expected: dim,
                actual: header.dim as usize,
            });
        }
        let count = header.count as usize;
        Ok(VectorStore {
            backing: Backing::File {
                path: path.to_path_buf(),
                map,
                file,
            },
            dim,
            chunk_size,
            count,
            region_rows: count,
            overlay: Vec::new(),
            flushed_upto: count,
        })
    }

    /// Open a branch file read-only at a snapshot's count (time travel).
    /// The file may have grown past the snapshot; `count` bounds reads.
    pub fn open_read_only(
        path: &Path,
        dim: usize,
        chunk_size: usize,
        count: usize,
    ) -> Result<Self> {
        let file = File::open(path).map_err(|e| ProximumError::io("vectors.load_commit", e))?;
        let map =
            unsafe { Mmap::map(&file) }.map_err(|e| ProximumError::io("vectors.load_commit", e))?;
        read_header(&map, "vectors.load_commit")?;
        Ok(VectorStore {
            backing: Backing::FileRo {
                path: path.to_path_buf(),
                map,
            },
            dim,
            chunk_size,
            count,
            region_rows: count,
            overlay: Vec::new(),
            flushed_upto: count,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn path(&self) -> Option<&Path> {
        self.backing.path()
    }

    /// Append one vector; returns its internal id.
    pub fn append(&mut self, vector: &[f32]) -> Result<u32> {
        if vector.len() != self.dim {
            return Err(ProximumError::DimensionMismatch {
                op: "insert",
                expected: self.dim,
                actual: vector.len(),
            });
        }
        let id = self.count as u32;
        match &mut self.backing {
            Backing::FileRo { .. } => {
                self.overlay.extend_from_slice(vector);
            }
            Backing::File { .. } | Backing::Anon { .. } => {
                self.ensure_capacity(self.region_rows + 1)?;
                let off = payload_offset(self.region_rows, self.dim);
                let bytes: &[u8] = bytemuck::cast_slice(vector);
                match &mut self.backing {
                    Backing::File { map, .. } | Backing::Anon { map } => {
                        map[off..off + bytes.len()].copy_from_slice(bytes);
                    }
                    Backing::FileRo { .. } => unreachable!(),
                }
                self.region_rows += 1;
            }
        }
        self.count += 1;
        Ok(id)
    }

    fn ensure_capacity(&mut self, vectors: usize) -> Result<()> {
        let needed = payload_offset(vectors, self.dim);
        let current = self.backing.bytes().len();
        if needed <= current {
            return Ok(());
        }
        let new_len = needed.max(current * 2);
        match &mut self.backing {
            Backing::File { file, map, .. } => {
                file.set_len(new_len as u64)
                    .map_err(|e| ProximumError::io("insert", e))?;
                *map = unsafe { MmapMut::map_mut(&*file) }
                    .map_err(|e| ProximumError::io("insert", e))?;
            }
            Backing::Anon { map } => {
                let mut grown =
                    MmapMut::map_anon(new_len).map_err(|e| ProximumError::io("insert", e))?;
                grown[..map.len()].copy_from_slice(map);
                *map = grown;
            }
            Backing::FileRo { .. } => unreachable!("read-only backing never grows"),
        }
        Ok(())
    }

    /// Zero-copy view of a stored vector. Panics on an out-of-range id —
    /// internal ids are produced by `append` and validated upstream.
    pub fn vector(&self, id: u32) -> &[f32] {
        let i = id as usize;
        assert!(i < self.count, "vector id {i} out of range {}", self.count);
        if i < self.region_rows {
            let off = payload_offset(i, self.dim);
            bytemuck::cast_slice(&self.backing.bytes()[off..off + self.dim * 4])
        } else {
            let start = (i - self.region_rows) * self.dim;
            &self.overlay[start..start + self.dim]
        }
    }

    /// SIMD distance between a query and a stored vector.
    pub fn distance_to(&self, query: &[f32], id: u32, kind: DistanceKind) -> f32 {
        distance(kind, query, self.vector(id))
    }

    /// Raw little-endian bytes of the vectors in `start..end`.
    fn chunk_bytes_range(&self, start: usize, end: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity((end - start) * self.dim * 4);
        for i in start..end {
            bytes.extend_from_slice(bytemuck::cast_slice(self.vector(i as u32)));
        }
        bytes
    }

    /// Persist every chunk touched since the last flush (completing the
    /// partial tail chunk) and update the header count. Returns
    /// `(position, address)` for each written chunk; the caller folds
    /// these into the vectors address map.
    pub fn flush(
        &mut self,
        crypto: bool,
        pool: &WritePool,
        pending: &mut Vec<PendingWrite>,
    ) -> Result<Vec<(u64, Uuid)>> {
        self.flush_upto(self.count, crypto, pool, pending)
    }

    /// Persist only chunks that are already full — the per-append hot
    /// path, called when an append crosses a chunk boundary so chunk
    /// writes overlap graph work instead of piling up at sync.
    pub fn flush_full(
        &mut self,
        crypto: bool,
        pool: &WritePool,
        pending: &mut Vec<PendingWrite>,
    ) -> Result<Vec<(u64, Uuid)>> {
        let full = (self.count / self.chunk_size) * self.chunk_size;
        self.flush_upto(full, crypto, pool, pending)
    }

    fn flush_upto(
        &mut self,
        upto: usize,
        crypto: bool,
        pool: &WritePool,
        pending: &mut Vec<PendingWrite>,
    ) -> Result<Vec<(u64, Uuid)>> {
        let upto = upto.min(self.count);
        if upto == 0 || upto <= self.flushed_upto {
            return Ok(Vec::new());
        }
        let first = self.flushed_upto / self.chunk_size;
        let last = (upto - 1) / self.chunk_size;
        let mut written = Vec::with_capacity(last - first + 1);
        for position in first..=last {
            let start = position * self.chunk_size;
            let end = ((position + 1) * self.chunk_size).min(upto);
            let bytes = self.chunk_bytes_range(start, end);
            let addr = if crypto {
                chunk_address(&bytes)
            } else {
                Uuid::new_v4()
            };
            pending.push(pool.put_async(addr.to_string(), bytes));
            written.push((position as u64, addr));
        }
        tracing::debug!(chunks = written.len(), upto, "flushed vector chunks");
        self.flushed_upto = upto;

        // Header count update is meaningful only on a file we own
        if let Backing::File { map, .. } = &mut self.backing {
            map[8..16].copy_from_slice(&(upto as u64).to_le_bytes());
            map.flush().map_err(|e| ProximumError::io("sync", e))?;
        }
        Ok(written)
    }

    /// Clamp the logical count to a snapshot's count (time travel: the
    /// branch file may have grown past the snapshot being loaded).
    pub(crate) fn clamp_to(&mut self, count: usize) {
        self.count = self.count.min(count);
        self.region_rows = self.region_rows.min(count);
        self.flushed_upto = self.flushed_upto.min(count);
    }

    /// Mark everything currently stored as flushed — used after
    /// rebuilding the region from already-persisted KV chunks.
    pub(crate) fn mark_all_flushed(&mut self) {
        self.flushed_upto = self.count;
    }

    /// In-memory fork: shares the mapped file, keeps its own appends in
    /// an overlay. O(1) for file-backed stores; the anonymous fallback
    /// copies its region.
    pub fn fork(&self) -> Result<VectorStore> {
        let backing = match &self.backing {
            Backing::File { path, .. } | Backing::FileRo { path, .. } => {
                let file = File::open(path).map_err(|e| ProximumError::io("fork", e))?;
                let map = unsafe { Mmap::map(&file) }.map_err(|e| ProximumError::io("fork", e))?;
                Backing::FileRo {
                    path: path.clone(),
                    map,
                }
            }
            Backing::Anon { map } => {
                let mut copy =
                    MmapMut::map_anon(map.len()).map_err(|e| ProximumError::io("fork", e))?;
                copy[..map.len()].copy_from_slice(map);
                Backing::Anon { map: copy }
            }
        };
        Ok(VectorStore {
            backing,
            dim: self.dim,
            chunk_size: self.chunk_size,
            count: self.count,
            region_rows: self.region_rows,
            overlay: self.overlay.clone(),
            flushed_upto: self.flushed_upto,
        })
    }

    /// Materialize this store (overlay included) as the primary file of a
    /// new branch. Reflink-copies the current file when possible.
    pub fn fork_for_branch(&self, new_path: Option<&Path>) -> Result<VectorStore> {
        if let (Some(dst), Some(src)) = (new_path, self.backing.path()) {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| ProximumError::io("vectors.fork_for_branch", e))?;
            }
            reflink_or_copy(src, dst)?;
            let mut vs = VectorStore::open(dst, self.dim, self.chunk_size)?;
            // The copied header count may trail the parent's region rows
            // (appends since the last flush); those bytes are in the file.
            vs.count = self.region_rows;
            vs.region_rows = self.region_rows;
            // Replay the overlay into the new file
            for i in self.region_rows..self.count {
                let row = self.vector(i as u32).to_vec();
                vs.append(&row)?;
            }
            vs.flushed_upto = self.flushed_upto.min(vs.count);
            Ok(vs)
        } else {
            // Anonymous source or target: rebuild from memory
            let mut vs = VectorStore::create(new_path, self.dim, self.chunk_size)?;
            for i in 0..self.count {
                let row = self.vector(i as u32).to_vec();
                vs.append(&row)?;
            }
            vs.flushed_upto = self.flushed_upto.min(vs.count);
            Ok(vs)
        }
    }
}
