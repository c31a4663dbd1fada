//! Dirty-buffer bookkeeping and the flush coordinator.
//!
//! The client does not own the byte-level layout of file data; it tracks
//! whole write buffers keyed by `(ino, offset)` so that capability
//! downgrades can be ordered against writeback. Per inode the derived state
//! machine is: clean, dirtying (dirty buffers exist), flushing (writeback in
//! flight, further writes still permitted), clean again.

use std::collections::BTreeMap;
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::caps::apply_cap_downgrade;
use crate::client::{Client, ClientInner};
use crate::message::FileCaps;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufState {
    Clean,
    Dirty,
    /// Writeback in flight.
    Tx,
}

struct Buffer {
    data: Vec<u8>,
    state: BufState,
    dirtied_at: Instant,
}

pub(crate) struct BufferCache {
    files: BTreeMap<u64, BTreeMap<u64, Buffer>>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    /// Lands a write buffer. Re-dirtying an offset that is mid-flight is
    /// fine: the committed bytes were snapshotted when the flush started.
    pub fn write(&mut self, ino: u64, offset: u64, data: &[u8]) {
        self.files.entry(ino).or_default().insert(
            offset,
            Buffer {
                data: data.to_vec(),
                state: BufState::Dirty,
                dirtied_at: Instant::now(),
            },
        );
    }

    /// Serves a read if one buffer covers the whole range.
    pub fn read(&self, ino: u64, offset: u64, len: usize) -> Option<Vec<u8>> {
        let bufs = self.files.get(&ino)?;
        let (&boff, buf) = bufs.range(..=offset).next_back()?;
        let rel = (offset - boff) as usize;
        if rel + len <= buf.data.len() {
            Some(buf.data[rel..rel + len].to_vec())
        } else {
            None
        }
    }

    /// Caches bytes that just came off the object pool.
    pub fn insert_clean(&mut self, ino: u64, offset: u64, data: Vec<u8>) {
        let bufs = self.files.entry(ino).or_default();
        // never shadow locally written state with read data
        if bufs.get(&offset).map_or(true, |b| b.state == BufState::Clean) {
            bufs.insert(
                offset,
                Buffer {
                    data,
                    state: BufState::Clean,
                    dirtied_at: Instant::now(),
                },
            );
        }
    }

    fn any(&self, ino: u64, state: BufState) -> bool {
        self.files
            .get(&ino)
            .map_or(false, |bufs| bufs.values().any(|b| b.state == state))
    }

    pub fn has_dirty(&self, ino: u64) -> bool {
        self.any(ino, BufState::Dirty)
    }

    pub fn has_inflight(&self, ino: u64) -> bool {
        self.any(ino, BufState::Tx)
    }

    pub fn has_uncommitted(&self, ino: u64) -> bool {
        self.has_dirty(ino) || self.has_inflight(ino)
    }

    pub fn dirty_inos(&self) -> Vec<u64> {
        self.files
            .iter()
            .filter(|(_, bufs)| bufs.values().any(|b| b.state != BufState::Clean))
            .map(|(&ino, _)| ino)
            .collect()
    }

    pub fn total_dirty(&self) -> usize {
        self.files
            .values()
            .flat_map(|bufs| bufs.values())
            .filter(|b| b.state == BufState::Dirty)
            .map(|b| b.data.len())
            .sum()
    }

    /// Marks every dirty buffer of `ino` in flight and returns the write
    /// jobs, offset-ascending.
    pub fn start_flush(&mut self, ino: u64) -> Vec<(u64, Vec<u8>)> {
        let mut jobs = Vec::new();
        if let Some(bufs) = self.files.get_mut(&ino) {
            for (&off, buf) in bufs.iter_mut() {
                if buf.state == BufState::Dirty {
                    buf.state = BufState::Tx;
                    jobs.push((off, buf.data.clone()));
                }
            }
        }
        jobs
    }

    /// The background policy: buffers older than `ttl` (or every dirty
    /// buffer when `all` is set) go in flight. Offset-ascending per inode.
    pub fn start_flush_aged(&mut self, ttl: Duration, now: Instant, all: bool) -> Vec<(u64, u64, Vec<u8>)> {
        let mut jobs = Vec::new();
        for (&ino, bufs) in self.files.iter_mut() {
            for (&off, buf) in bufs.iter_mut() {
                if buf.state == BufState::Dirty
                    && (all || now.duration_since(buf.dirtied_at) >= ttl)
                {
                    buf.state = BufState::Tx;
                    jobs.push((ino, off, buf.data.clone()));
                }
            }
        }
        jobs
    }

    /// Writeback completion. A buffer that was re-dirtied while in flight
    /// stays dirty and will flush again.
    pub fn commit(&mut self, ino: u64, offset: u64) {
        if let Some(buf) = self.files.get_mut(&ino).and_then(|bufs| bufs.get_mut(&offset)) {
            if buf.state == BufState::Tx {
                buf.state = BufState::Clean;
            }
        }
    }

    pub fn write_failed(&mut self, ino: u64, offset: u64) {
        if let Some(buf) = self.files.get_mut(&ino).and_then(|bufs| bufs.get_mut(&offset)) {
            if buf.state == BufState::Tx {
                buf.state = BufState::Dirty;
            }
        }
    }

    /// Drops clean read state for `ino` (required before RDCACHE goes away).
    pub fn invalidate_clean(&mut self, ino: u64) {
        if let Some(bufs) = self.files.get_mut(&ino) {
            bufs.retain(|_, b| b.state != BufState::Clean);
            if bufs.is_empty() {
                self.files.remove(&ino);
            }
        }
    }

    /// Drops buffers past a new end of file.
    pub fn truncate(&mut self, ino: u64, size: u64) {
        if let Some(bufs) = self.files.get_mut(&ino) {
            bufs.retain(|&off, _| off < size);
            for (&off, buf) in bufs.iter_mut() {
                let keep = (size - off) as usize;
                if buf.data.len() > keep {
                    buf.data.truncate(keep);
                }
            }
        }
    }

    /// Unmount teardown. Everything must have drained by now.
    pub fn tear_down(&mut self) {
        for (&ino, bufs) in &self.files {
            assert!(
                bufs.values().all(|b| b.state == BufState::Clean),
                "tearing down bcache with undrained buffers on ino {:x}",
                ino
            );
        }
        self.files.clear();
    }
}

impl Client {
    fn submit_write(self: &Arc<Self>, ino: u64, offset: u64, data: Vec<u8>) {
        let client = Arc::clone(self);
        self.filer.write(
            ino,
            offset,
            data,
            Box::new(move |res| client.bh_write_commit(ino, offset, res)),
        );
    }

    /// Starts writeback of an inode's dirty buffers without waiting.
    pub(crate) fn kick_flush(self: &Arc<Self>, ino: u64) {
        let jobs = self.lock().bcache.start_flush(ino);
        for (off, data) in jobs {
            self.submit_write(ino, off, data);
        }
    }

    /// Writeback completion: retire the buffer, and when the inode has
    /// drained, wake flushed-waiters and settle deferred cap downgrades.
    fn bh_write_commit(self: &Arc<Self>, ino: u64, offset: u64, res: Result<(), errno::Errno>) {
        let mut inner = self.lock();
        match res {
            Ok(()) => inner.bcache.commit(ino, offset),
            Err(e) => {
                warn!("writeback of ino {:x} @{} failed: {:?}", ino, offset, e);
                inner.bcache.write_failed(ino, offset);
            }
        }
        if !inner.bcache.has_uncommitted(ino) {
            let reaped: Vec<FileCaps> = {
                let keys: Vec<(u64, usize)> = inner
                    .cap_reap
                    .keys()
                    .filter(|(i, _)| *i == ino)
                    .copied()
                    .collect();
                keys.iter()
                    .map(|k| inner.cap_reap.remove(k).unwrap())
                    .collect()
            };
            for m in &reaped {
                debug!("ino {:x}: flushed, acking deferred downgrade to mds{}", ino, m.mds);
                apply_cap_downgrade(&mut inner, m);
            }
            self.cond.notify_all();
        }
        drop(inner);
        self.drain_outbox();
    }

    /// Synchronously drains all dirty buffers of `ino`. New writes may land
    /// while the lock is dropped; the loop picks them up too.
    pub(crate) fn flush_inode_buffers<'a>(
        self: &'a Arc<Self>,
        mut inner: MutexGuard<'a, ClientInner>,
        ino: u64,
    ) -> MutexGuard<'a, ClientInner> {
        loop {
            let jobs = inner.bcache.start_flush(ino);
            if jobs.is_empty() && !inner.bcache.has_inflight(ino) {
                return inner;
            }
            drop(inner);
            for (off, data) in jobs {
                self.submit_write(ino, off, data);
            }
            inner = self.lock();
            while inner.bcache.has_inflight(ino) {
                inner = self.cond_wait(inner);
            }
        }
    }

    /// Background flush policy: writes back aged buffers, or everything
    /// dirty when the total exceeds `dirty_max`. Fire and forget.
    pub fn flush_buffers(self: &Arc<Self>, ttl: Duration, dirty_max: usize) {
        let jobs = {
            let mut inner = self.lock();
            let all = inner.bcache.total_dirty() > dirty_max;
            inner.bcache.start_flush_aged(ttl, Instant::now(), all)
        };
        for (ino, off, data) in jobs {
            self.submit_write(ino, off, data);
        }
    }
}
