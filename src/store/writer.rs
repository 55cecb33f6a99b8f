//! Background write pool
//!
//! Chunk flushes and PSS node writes are issued here and awaited at
//! `sync` time, so an insert-heavy workload overlaps graph work with
//! storage I/O. Worker threads drain a crossbeam channel; each enqueued
//! write hands back a [`PendingWrite`] receipt that `sync` (and `close`)
//! must observe before publishing a commit.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::thread::JoinHandle;

use crate::error::{ProximumError, Result};

use super::StoreHandle;

const WORKERS: usize = 4;

struct Job {
    key: String,
    value: Vec<u8>,
    done: Sender<Result<()>>,
}

/// Receipt for one enqueued write.
pub struct PendingWrite {
    rx: Receiver<Result<()>>,
}

impl PendingWrite {
    /// Block until the write lands (or fails).
    pub fn wait(self) -> Result<()> {
        match self.rx.recv() {
            Ok(result) => result,
            // Worker died without replying; surface as I/O
            Err(_) => Err(ProximumError::io(
                "store.write",
                std::io::Error::other("write pool worker exited"),
            )),
        }
    }
}

/// Fixed pool of writer threads over a shared store handle.
pub struct WritePool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WritePool {
    pub fn new(store: StoreHandle) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..WORKERS)
            .map(|i| {
                let rx = rx.clone();
                let store = store.clone();
                std::thread::Builder::new()
                    .name(format!("proximum-writer-{i}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            let result = store.put(&job.key, job.value);
                            if let Err(e) = &result {
                                tracing::warn!(key = %job.key, error = %e, "async write failed");
                            }
                            // Receiver may have been dropped (fire-and-forget)
                            let _ = job.done.send(result);
                        }
                    })
                    .expect("spawn writer thread")
            })
            .collect();
        WritePool {
            tx: Some(tx),
            workers,
        }
    }

    /// Enqueue a write; returns a receipt to await.
    pub fn put_async(&self, key: String, value: Vec<u8>) -> PendingWrite {
        let (done, rx) = bounded(1);
        let job = Job { key, value, done };
        if let Some(tx) = &self.tx {
            if tx.send(job).is_ok() {
                return PendingWrite { rx };
            }
        }
        // Pool shut down; the receipt will report the failure
        PendingWrite { rx }
    }
}

impl Drop for WritePool {
    fn drop(&mut self) {
        // Close the channel so workers drain and exit
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvStore, MemStore};
    use std::sync::Arc;

    #[test]
    fn test_writes_land_and_receipts_resolve() {
        let store = Arc::new(MemStore::new());
        let pool = WritePool::new(store.clone());

        let receipts: Vec<_> = (0..64)
            .map(|i| pool.put_async(format!("k{i}"), vec![i as u8]))
            .collect();
        for receipt in receipts {
            receipt.wait().unwrap();
        }
        assert_eq!(store.len(), 64);
        assert_eq!(store.get("k7").unwrap(), Some(vec![7]));
    }

    #[test]
    fn test_drop_drains_outstanding_writes() {
        let store = Arc::new(MemStore::new());
        {
            let pool = WritePool::new(store.clone());
            for i in 0..32 {
                // Receipts intentionally dropped
                let _ = pool.put_async(format!("k{i}"), vec![0]);
            }
        }
        // Pool drop joins workers after the channel drains
        assert_eq!(store.len(), 32);
    }
}
