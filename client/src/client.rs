//! The client: one coarse lock over cache, handles, caps and buffer state,
//! with a POSIX-like facade on top.
//!
//! Blocking happens in three places only (awaiting an MDS reply, awaiting
//! object I/O, awaiting a cap re-issue), and each drops the lock and parks
//! on the shared condition, re-checking its predicate after every wakeup.
//! Messages composed under the lock go to the outbox and hit the wire only
//! after the lock is released.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use errno::Errno;
use log::{debug, trace};

use crate::buffer::BufferCache;
use crate::cache::{MetaCache, Resolved};
use crate::caps::{CapMask, InodeCap};
use crate::config::{FH_ID_MAX, LRU_MAX, MDS_ROOT};
use crate::filer::Filer;
use crate::flags::OpenFlags;
use crate::handle::{Fh, FhTable};
use crate::message::{
    FileCaps, InodeAttr, Message, Messenger, MetaArg, MetaOp, MetaReply, ReplyData, StatFs,
    TimeSpec,
};
use crate::path::FilePath;

pub(crate) struct ClientInner {
    pub cache: MetaCache,
    pub fhs: FhTable,
    pub bcache: BufferCache,
    /// Revokes waiting for their inode to drain, keyed by `(ino, mds)`.
    pub cap_reap: BTreeMap<(u64, usize), FileCaps>,
    /// Reply slots for in-flight metadata requests, keyed by tid.
    pub pending: BTreeMap<u64, Option<MetaReply>>,
    pub pending_reads: BTreeMap<u64, Option<Result<Vec<u8>, Errno>>>,
    pub pending_writes: BTreeMap<u64, Option<Result<(), Errno>>>,
    /// Messages composed under the lock, sent after it is released.
    pub outbox: Vec<(usize, Message)>,
    pub next_tid: u64,
    pub next_io: u64,
    pub osd_epoch: u64,
    pub mounted: bool,
    pub unmounting: bool,
}

pub struct Client {
    inner: Mutex<ClientInner>,
    pub(crate) cond: Condvar,
    pub(crate) messenger: Arc<dyn Messenger>,
    pub(crate) filer: Arc<dyn Filer>,
}

impl Client {
    pub fn new(messenger: Arc<dyn Messenger>, filer: Arc<dyn Filer>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ClientInner {
                cache: MetaCache::new(LRU_MAX),
                fhs: FhTable::new(FH_ID_MAX),
                bcache: BufferCache::new(),
                cap_reap: BTreeMap::new(),
                pending: BTreeMap::new(),
                pending_reads: BTreeMap::new(),
                pending_writes: BTreeMap::new(),
                outbox: Vec::new(),
                next_tid: 1,
                next_io: 1,
                osd_epoch: 0,
                mounted: false,
                unmounting: false,
            }),
            cond: Condvar::new(),
            messenger,
            filer,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().expect("client lock poisoned")
    }

    pub(crate) fn cond_wait<'a>(
        &self,
        guard: MutexGuard<'a, ClientInner>,
    ) -> MutexGuard<'a, ClientInner> {
        self.cond.wait(guard).expect("client lock poisoned")
    }

    /// Sends everything queued under the lock. Must be called with the lock
    /// free; sending may deliver replies synchronously, which re-enter
    /// through `dispatch` and may queue more.
    pub(crate) fn drain_outbox(&self) {
        loop {
            let msgs = {
                let mut inner = self.lock();
                std::mem::take(&mut inner.outbox)
            };
            if msgs.is_empty() {
                return;
            }
            for (mds, msg) in msgs {
                if let Err(e) = self.messenger.send(mds, msg) {
                    trace!("dropping message to mds{} ({:?})", mds, e);
                }
            }
        }
    }

    fn ensure_mounted(&self, inner: &ClientInner) -> Result<(), Errno> {
        if inner.mounted && !inner.unmounting {
            Ok(())
        } else {
            Err(Errno::ENOTCONN)
        }
    }

    /// Caps the dentry cache; the next trim honors it.
    pub fn set_cache_size(&self, max: usize) {
        self.lock().cache.lru.set_max(max);
    }

    pub fn trim_cache(&self) {
        self.lock().cache.trim();
    }

    pub fn dump_cache(&self) {
        self.lock().cache.dump();
    }

    /// Asserts every cache invariant. Debugging aid; cheap enough for tests
    /// to call after every step.
    pub fn verify_cache(&self) {
        let inner = self.lock();
        let fh_refs = inner.fhs.refs_by_ino();
        inner.cache.verify(&fh_refs);
    }

    // ------------------------------------------------------------------
    // mount / unmount

    /// Primes the cache with the root inode from MDS 0.
    pub fn mount(self: &Arc<Self>) -> Result<(), Errno> {
        trace!("MOUNT");
        let inner = self.lock();
        if inner.mounted {
            return Err(Errno::EBUSY);
        }
        let (mut inner, res) = self.make_request(
            inner,
            MetaOp::Lstat,
            FilePath::root(),
            MetaArg::None,
            false,
            Some(MDS_ROOT),
        );
        res?;
        inner.mounted = true;
        debug!("mounted, root ino {:x?}", inner.cache.root());
        Ok(())
    }

    /// Quiesces and tears down: waits for every handle to close, drains all
    /// dirty buffers, releases all caps, then empties the cache.
    pub fn unmount(self: &Arc<Self>) -> Result<(), Errno> {
        trace!("UNMOUNT");
        let mut inner = self.lock();
        if !inner.mounted {
            return Err(Errno::ENOTCONN);
        }
        if inner.unmounting {
            return Err(Errno::EBUSY);
        }
        inner.unmounting = true;
        while !inner.fhs.is_empty() {
            debug!("unmount: waiting on {} open handles", inner.fhs.len());
            inner = self.cond_wait(inner);
        }
        for ino in inner.bcache.dirty_inos() {
            inner = self.flush_inode_buffers(inner, ino);
        }
        for ino in inner.cache.inos() {
            inner = self.release_caps(inner, ino, CapMask::empty());
        }
        inner.bcache.tear_down();
        inner.cache.clear();
        if let Some(root) = inner.cache.root() {
            inner.cache.put_inode(root);
        }
        assert!(inner.cache.is_empty(), "cache not drained at unmount");
        inner.mounted = false;
        inner.unmounting = false;
        drop(inner);
        self.drain_outbox();
        debug!("unmounted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // namespace operations

    fn path_request(
        self: &Arc<Self>,
        op: MetaOp,
        path: FilePath,
        arg: MetaArg,
        auth_best: bool,
    ) -> Result<MetaReply, Errno> {
        let inner = self.lock();
        self.ensure_mounted(&inner)?;
        let (inner, res) = self.make_request(inner, op, path, arg, auth_best, None);
        drop(inner);
        self.drain_outbox();
        res
    }

    pub fn statfs(self: &Arc<Self>) -> Result<StatFs, Errno> {
        trace!("STATFS");
        let reply = self.path_request(MetaOp::Statfs, FilePath::root(), MetaArg::None, false)?;
        match reply.data {
            ReplyData::Statfs(s) => Ok(s),
            _ => Err(Errno::EIO),
        }
    }

    pub fn lstat(self: &Arc<Self>, path: &str) -> Result<InodeAttr, Errno> {
        trace!("LSTAT {}", path);
        let path = FilePath::new(path);
        let mut inner = self.lock();
        self.ensure_mounted(&inner)?;
        if let Resolved::Hit { ino, .. } = inner.cache.resolve(&path) {
            return Ok(inner.cache.inode(ino).unwrap().attr.clone());
        }
        let (inner, res) = self.make_request(inner, MetaOp::Lstat, path, MetaArg::None, false, None);
        let reply = res?;
        let ino = terminal_ino(&reply)?;
        inner
            .cache
            .inode(ino)
            .map(|i| i.attr.clone())
            .ok_or(Errno::EIO)
    }

    pub fn getdir(self: &Arc<Self>, path: &str) -> Result<Vec<(String, InodeAttr)>, Errno> {
        trace!("GETDIR {}", path);
        let path = FilePath::new(path);
        let inner = self.lock();
        self.ensure_mounted(&inner)?;
        let (mut inner, res) =
            self.make_request(inner, MetaOp::Getdir, path, MetaArg::None, false, None);
        let reply = res?;
        let dir_ino = terminal_ino(&reply)?;
        let ReplyData::Dir(entries) = reply.data else {
            return Err(Errno::EIO);
        };
        if !entries.is_empty() {
            inner.cache.insert_readdir(dir_ino, &entries);
            inner.cache.trim();
        }
        Ok(entries.into_iter().map(|(n, i)| (n, i.attr)).collect())
    }

    pub fn mkdir(self: &Arc<Self>, path: &str, mode: u32) -> Result<(), Errno> {
        trace!("MKDIR {} {:o}", path, mode);
        self.path_request(MetaOp::Mkdir, FilePath::new(path), MetaArg::Mode(mode), true)
            .map(|_| ())
    }

    pub fn mknod(self: &Arc<Self>, path: &str, mode: u32) -> Result<(), Errno> {
        trace!("MKNOD {} {:o}", path, mode);
        self.path_request(MetaOp::Mknod, FilePath::new(path), MetaArg::Mode(mode), true)
            .map(|_| ())
    }

    pub fn symlink(self: &Arc<Self>, target: &str, path: &str) -> Result<(), Errno> {
        trace!("SYMLINK {} -> {}", path, target);
        self.path_request(
            MetaOp::Symlink,
            FilePath::new(path),
            MetaArg::Target(target.to_string()),
            true,
        )
        .map(|_| ())
    }

    pub fn readlink(self: &Arc<Self>, path: &str) -> Result<String, Errno> {
        trace!("READLINK {}", path);
        let path = FilePath::new(path);
        let mut inner = self.lock();
        self.ensure_mounted(&inner)?;
        let ino = match inner.cache.resolve(&path) {
            Resolved::Hit { ino, .. } => ino,
            Resolved::Miss { .. } => {
                let (g, res) =
                    self.make_request(inner, MetaOp::Lstat, path, MetaArg::None, false, None);
                inner = g;
                terminal_ino(&res?)?
            }
        };
        let inode = inner.cache.inode(ino).ok_or(Errno::EIO)?;
        if !inode.attr.mode.is_lnk() {
            return Err(Errno::EINVAL);
        }
        inode.symlink.clone().ok_or(Errno::EIO)
    }

    /// Creates a new hard link at `newpath` for the file at `path`.
    pub fn link(self: &Arc<Self>, path: &str, newpath: &str) -> Result<(), Errno> {
        trace!("LINK {} -> {}", newpath, path);
        self.path_request(
            MetaOp::Link,
            FilePath::new(path),
            MetaArg::Path(FilePath::new(newpath)),
            true,
        )
        .map(|_| ())
    }

    pub fn unlink(self: &Arc<Self>, path: &str) -> Result<(), Errno> {
        trace!("UNLINK {}", path);
        let path = FilePath::new(path);
        let inner = self.lock();
        self.ensure_mounted(&inner)?;
        let (mut inner, res) =
            self.make_request(inner, MetaOp::Unlink, path.clone(), MetaArg::None, true, None);
        res?;
        if let Some(dn) = inner.cache.lookup_path(&path) {
            inner.cache.unlink(dn);
        }
        Ok(())
    }

    pub fn rmdir(self: &Arc<Self>, path: &str) -> Result<(), Errno> {
        trace!("RMDIR {}", path);
        let path = FilePath::new(path);
        let inner = self.lock();
        self.ensure_mounted(&inner)?;
        let (mut inner, res) =
            self.make_request(inner, MetaOp::Rmdir, path.clone(), MetaArg::None, true, None);
        res?;
        if let Some(dn) = inner.cache.lookup_path(&path) {
            inner.cache.unlink(dn);
        }
        Ok(())
    }

    /// The reply trace is the new location; splicing it moves the cached
    /// dentry and closes the old parent if it emptied out.
    pub fn rename(self: &Arc<Self>, from: &str, to: &str) -> Result<(), Errno> {
        trace!("RENAME {} -> {}", from, to);
        self.path_request(
            MetaOp::Rename,
            FilePath::new(from),
            MetaArg::Path(FilePath::new(to)),
            true,
        )
        .map(|_| ())
    }

    pub fn chmod(self: &Arc<Self>, path: &str, mode: u32) -> Result<(), Errno> {
        trace!("CHMOD {} {:o}", path, mode);
        self.path_request(MetaOp::Chmod, FilePath::new(path), MetaArg::Mode(mode), true)
            .map(|_| ())
    }

    pub fn chown(self: &Arc<Self>, path: &str, uid: u32, gid: u32) -> Result<(), Errno> {
        trace!("CHOWN {} {}:{}", path, uid, gid);
        self.path_request(
            MetaOp::Chown,
            FilePath::new(path),
            MetaArg::Owner { uid, gid },
            true,
        )
        .map(|_| ())
    }

    pub fn utime(self: &Arc<Self>, path: &str, atime: TimeSpec, mtime: TimeSpec) -> Result<(), Errno> {
        trace!("UTIME {}", path);
        self.path_request(
            MetaOp::Utime,
            FilePath::new(path),
            MetaArg::Times { atime, mtime },
            true,
        )
        .map(|_| ())
    }

    pub fn truncate(self: &Arc<Self>, path: &str, size: u64) -> Result<(), Errno> {
        trace!("TRUNCATE {} {}", path, size);
        let path = FilePath::new(path);
        let inner = self.lock();
        self.ensure_mounted(&inner)?;
        let (mut inner, res) =
            self.make_request(inner, MetaOp::Truncate, path, MetaArg::Size(size), true, None);
        let reply = res?;
        let ino = terminal_ino(&reply)?;
        inner.bcache.truncate(ino, size);
        Ok(())
    }

    // ------------------------------------------------------------------
    // file I/O

    /// Opens a file; the returned handle is bound to the MDS that serviced
    /// the open and to its initial cap grant.
    pub fn open(self: &Arc<Self>, path: &str, flags: OpenFlags) -> Result<u32, Errno> {
        trace!("OPEN {} {:?}", path, flags);
        let path = FilePath::new(path);
        let inner = self.lock();
        self.ensure_mounted(&inner)?;
        let auth_best = flags.writable() || flags.contains(OpenFlags::O_CREAT);
        let (mut inner, res) =
            self.make_request(inner, MetaOp::Open, path, MetaArg::Flags(flags), auth_best, None);
        let reply = res?;
        let ino = terminal_ino(&reply)?;
        let mds = reply.mds;
        let ReplyData::Open { caps, seq } = reply.data else {
            return Err(Errno::EIO);
        };
        {
            let inode = inner.cache.inode_mut(ino).ok_or(Errno::EIO)?;
            if flags.contains(OpenFlags::O_DIRECTORY) && !inode.attr.mode.is_dir() {
                return Err(Errno::ENOTDIR);
            }
            // merge the open grant; a newer seq supersedes stale state
            inode.stale_caps.remove(&mds);
            match inode.caps.get_mut(&mds) {
                Some(cap) if cap.seq >= seq => {}
                Some(cap) => {
                    cap.caps = caps;
                    cap.seq = seq;
                }
                None => {
                    inode.caps.insert(mds, InodeCap { caps, seq });
                }
            }
            if flags.readable() {
                inode.num_readers += 1;
            }
            if flags.writable() {
                inode.num_writers += 1;
            }
        }
        inner.cache.get_inode(ino);
        if flags.contains(OpenFlags::O_TRUNC) {
            inner.bcache.truncate(ino, 0);
        }
        let id = match inner.fhs.alloc(Fh { ino, mds, flags }) {
            Ok(id) => id,
            Err(e) => {
                let inode = inner.cache.inode_mut(ino).unwrap();
                if flags.readable() {
                    inode.num_readers -= 1;
                }
                if flags.writable() {
                    inode.num_writers -= 1;
                }
                inner.cache.put_inode(ino);
                return Err(e);
            }
        };
        self.update_caps_wanted(&mut inner, ino);
        drop(inner);
        self.drain_outbox();
        Ok(id)
    }

    /// Closes a handle. The cap manager sees the reader/writer decrement,
    /// and releases what is no longer wanted, before the id is recycled.
    pub fn close(self: &Arc<Self>, fh: u32) -> Result<(), Errno> {
        trace!("CLOSE {}", fh);
        let mut inner = self.lock();
        if !inner.mounted {
            return Err(Errno::ENOTCONN);
        }
        let Fh { ino, flags, .. } = inner.fhs.get(fh)?.clone();
        {
            let inode = inner.cache.inode_mut(ino).ok_or(Errno::EBADF)?;
            if flags.readable() {
                inode.num_readers -= 1;
            }
            if flags.writable() {
                inode.num_writers -= 1;
            }
        }
        self.update_caps_wanted(&mut inner, ino);
        let retain = inner
            .cache
            .inode(ino)
            .map(|i| i.wanted())
            .unwrap_or_else(CapMask::empty);
        inner = self.release_caps(inner, ino, retain);
        inner.fhs.remove(fh)?;
        inner.cache.put_inode(ino);
        self.cond.notify_all();
        drop(inner);
        self.drain_outbox();
        Ok(())
    }

    pub fn read(self: &Arc<Self>, fh: u32, offset: u64, len: usize) -> Result<Vec<u8>, Errno> {
        trace!("READ {} @{} +{}", fh, offset, len);
        let inner = self.lock();
        if !inner.mounted {
            return Err(Errno::ENOTCONN);
        }
        let Fh { ino, mds, flags } = inner.fhs.get(fh)?.clone();
        if !flags.readable() {
            return Err(Errno::EBADF);
        }
        let (inner, ok) = self.await_caps(inner, ino, mds, CapMask::RD);
        if !ok {
            debug!("read: no live RD cap from mds{} on ino {:x}", mds, ino);
            return Err(Errno::ESTALE);
        }
        let inode = inner.cache.inode(ino).ok_or(Errno::EBADF)?;
        let size = inode.attr.size;
        let cached = inode.mds_caps(mds).contains(CapMask::RDCACHE);
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = len.min((size - offset) as usize);
        if cached {
            if let Some(bytes) = inner.bcache.read(ino, offset, len) {
                return Ok(bytes);
            }
        }
        drop(inner);
        let bytes = self.filer_read(ino, offset, len)?;
        if cached {
            let mut inner = self.lock();
            // cache only while the grant still stands
            if inner
                .cache
                .inode(ino)
                .map_or(false, |i| i.mds_caps(mds).contains(CapMask::RDCACHE))
            {
                inner.bcache.insert_clean(ino, offset, bytes.clone());
            }
        }
        Ok(bytes)
    }

    pub fn write(self: &Arc<Self>, fh: u32, offset: u64, data: &[u8]) -> Result<usize, Errno> {
        trace!("WRITE {} @{} +{}", fh, offset, data.len());
        let inner = self.lock();
        if !inner.mounted {
            return Err(Errno::ENOTCONN);
        }
        let Fh { ino, mds, flags } = inner.fhs.get(fh)?.clone();
        if !flags.writable() {
            return Err(Errno::EBADF);
        }
        let offset = if flags.contains(OpenFlags::O_APPEND) {
            inner.cache.inode(ino).ok_or(Errno::EBADF)?.attr.size
        } else {
            offset
        };
        let (mut inner, ok) = self.await_caps(inner, ino, mds, CapMask::WR);
        if !ok {
            debug!("write: no live WR cap from mds{} on ino {:x}", mds, ino);
            return Err(Errno::ESTALE);
        }
        let buffered = {
            let inode = inner.cache.inode_mut(ino).ok_or(Errno::EBADF)?;
            let end = offset + data.len() as u64;
            if end > inode.attr.size {
                inode.attr.size = end;
            }
            if end > inode.wr_max_offset {
                inode.wr_max_offset = end;
            }
            inode.wr_last = Some(Instant::now());
            inode.mds_caps(mds).contains(CapMask::WRBUFFER)
        };
        if buffered {
            inner.bcache.write(ino, offset, data);
            Ok(data.len())
        } else {
            drop(inner);
            self.filer_write_sync(ino, offset, data.to_vec())?;
            Ok(data.len())
        }
    }

    /// Blocks until every dirty buffer of the handle's inode is on storage.
    pub fn fsync(self: &Arc<Self>, fh: u32) -> Result<(), Errno> {
        trace!("FSYNC {}", fh);
        let inner = self.lock();
        if !inner.mounted {
            return Err(Errno::ENOTCONN);
        }
        let ino = inner.fhs.get(fh)?.ino;
        let _inner = self.flush_inode_buffers(inner, ino);
        Ok(())
    }

    // ------------------------------------------------------------------
    // blocking object I/O

    fn filer_read(self: &Arc<Self>, ino: u64, offset: u64, len: usize) -> Result<Vec<u8>, Errno> {
        let ticket = {
            let mut inner = self.lock();
            let t = inner.next_io;
            inner.next_io += 1;
            inner.pending_reads.insert(t, None);
            t
        };
        let client = Arc::clone(self);
        self.filer.read(
            ino,
            offset,
            len,
            Box::new(move |res| {
                let mut inner = client.lock();
                inner.pending_reads.insert(ticket, Some(res));
                client.cond.notify_all();
            }),
        );
        let mut inner = self.lock();
        while inner.pending_reads.get(&ticket).map_or(false, |s| s.is_none()) {
            inner = self.cond_wait(inner);
        }
        inner
            .pending_reads
            .remove(&ticket)
            .flatten()
            .unwrap_or(Err(Errno::EIO))
    }

    fn filer_write_sync(self: &Arc<Self>, ino: u64, offset: u64, data: Vec<u8>) -> Result<(), Errno> {
        let ticket = {
            let mut inner = self.lock();
            let t = inner.next_io;
            inner.next_io += 1;
            inner.pending_writes.insert(t, None);
            t
        };
        let client = Arc::clone(self);
        self.filer.write(
            ino,
            offset,
            data,
            Box::new(move |res| {
                let mut inner = client.lock();
                inner.pending_writes.insert(ticket, Some(res));
                client.cond.notify_all();
            }),
        );
        let mut inner = self.lock();
        while inner.pending_writes.get(&ticket).map_or(false, |s| s.is_none()) {
            inner = self.cond_wait(inner);
        }
        inner
            .pending_writes
            .remove(&ticket)
            .flatten()
            .unwrap_or(Err(Errno::EIO))
    }
}

fn terminal_ino(reply: &MetaReply) -> Result<u64, Errno> {
    reply
        .trace
        .last()
        .map(|step| step.info.attr.ino)
        .ok_or(Errno::EIO)
}
