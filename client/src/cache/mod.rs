//! The in-memory metadata cache.
//!
//! The cache learns the directory/inode graph exclusively from MDS reply
//! traces ([`MetaCache::insert_trace`]) and forgets it under LRU pressure
//! ([`MetaCache::trim`]). Mutation primitives keep the graph invariants:
//! edges are symmetric, a dir is resident only while it has entries, and an
//! inode's ref count is exactly its dentry edge + open handles + open dir +
//! the root hold.

mod inode;
mod resolve;

pub use inode::{Dentry, DentryId, Dir, Inode};
pub use resolve::Resolved;

use std::collections::BTreeMap;

use log::{debug, trace};
use lru_list::LruList;

use crate::config::MDS_ROOT;
use crate::message::{InodeInfo, TraceStep};

pub struct MetaCache {
    inodes: BTreeMap<u64, Inode>,
    dentries: Vec<Option<Dentry>>,
    recycled: Vec<DentryId>,
    pub(crate) lru: LruList<DentryId>,
    root: Option<u64>,
}

impl MetaCache {
    pub fn new(lru_max: usize) -> Self {
        Self {
            inodes: BTreeMap::new(),
            dentries: Vec::new(),
            recycled: Vec::new(),
            lru: LruList::new(lru_max),
            root: None,
        }
    }

    pub fn root(&self) -> Option<u64> {
        self.root
    }

    pub fn inode(&self, ino: u64) -> Option<&Inode> {
        self.inodes.get(&ino)
    }

    pub fn inode_mut(&mut self, ino: u64) -> Option<&mut Inode> {
        self.inodes.get_mut(&ino)
    }

    pub fn dentry(&self, dn: DentryId) -> &Dentry {
        self.dentries[dn].as_ref().expect("stale dentry id")
    }

    fn dentry_mut(&mut self, dn: DentryId) -> &mut Dentry {
        self.dentries[dn].as_mut().expect("stale dentry id")
    }

    pub fn num_inodes(&self) -> usize {
        self.inodes.len()
    }

    pub fn num_dentries(&self) -> usize {
        self.dentries.len() - self.recycled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    pub fn inos(&self) -> Vec<u64> {
        self.inodes.keys().copied().collect()
    }

    fn alloc_dentry(&mut self, d: Dentry) -> DentryId {
        if let Some(dn) = self.recycled.pop() {
            self.dentries[dn] = Some(d);
            dn
        } else {
            self.dentries.push(Some(d));
            self.dentries.len() - 1
        }
    }

    fn free_dentry(&mut self, dn: DentryId) {
        assert!(self.dentries[dn].take().is_some());
        self.recycled.push(dn);
    }

    /// Creates a dentry `dir/name -> ino` and takes a ref on the target.
    ///
    /// The name must be free and the target must not have a parent edge yet.
    pub fn link(&mut self, dir_ino: u64, name: &str, ino: u64) -> DentryId {
        trace!("link {:x}/{} -> {:x}", dir_ino, name, ino);
        let dn = self.alloc_dentry(Dentry {
            dir: dir_ino,
            name: name.to_string(),
            ino,
            pinned: false,
        });
        {
            let dir_inode = self.inodes.get_mut(&dir_ino).expect("link: no parent inode");
            let dir = dir_inode.dir.as_mut().expect("link: parent dir not open");
            let prev = dir.dentries.insert(name.to_string(), dn);
            assert!(prev.is_none(), "link: {:?} already present", name);
        }
        let target_has_dir = {
            let inode = self.inodes.get_mut(&ino).expect("link: no target inode");
            assert!(inode.dn.is_none(), "link: inode {:x} already linked", ino);
            inode.dn = Some(dn);
            inode.refs += 1;
            inode.dir.is_some()
        };
        self.lru.insert_mid(dn);
        if target_has_dir {
            self.dentry_mut(dn).pinned = true;
            self.lru.pin(dn);
        }
        dn
    }

    /// Destroys a dentry, dropping its ref on the target and closing the
    /// parent dir if this was its last entry.
    pub fn unlink(&mut self, dn: DentryId) {
        let (dir_ino, name, ino) = {
            let d = self.dentry(dn);
            (d.dir, d.name.clone(), d.ino)
        };
        trace!("unlink {:x}/{} -> {:x}", dir_ino, name, ino);
        {
            let inode = self.inodes.get_mut(&ino).expect("unlink: no target inode");
            if inode.dn == Some(dn) {
                inode.dn = None;
            }
        }
        self.put_inode(ino);
        let now_empty = {
            let dir_inode = self
                .inodes
                .get_mut(&dir_ino)
                .expect("unlink: no parent inode");
            let dir = dir_inode.dir.as_mut().expect("unlink: parent dir not open");
            dir.dentries.remove(&name);
            dir.is_empty()
        };
        if now_empty {
            self.close_dir(dir_ino);
        }
        self.lru.remove(dn);
        self.free_dentry(dn);
    }

    /// Moves a dentry under a new parent and name without touching the
    /// target's ref. Installs under the new name first, then erases the old
    /// entry, then rewrites the dentry fields.
    pub fn relink(&mut self, dn: DentryId, new_dir: u64, new_name: &str) {
        let (old_dir, old_name) = {
            let d = self.dentry(dn);
            (d.dir, d.name.clone())
        };
        trace!(
            "relink {:x}/{} -> {:x}/{}",
            old_dir,
            old_name,
            new_dir,
            new_name
        );
        {
            let nd = self.inodes.get_mut(&new_dir).expect("relink: no new parent");
            let dir = nd.dir.as_mut().expect("relink: new parent dir not open");
            let prev = dir.dentries.insert(new_name.to_string(), dn);
            assert!(prev.is_none(), "relink: {:?} already present", new_name);
        }
        let now_empty = {
            let od = self.inodes.get_mut(&old_dir).expect("relink: no old parent");
            let dir = od.dir.as_mut().expect("relink: old parent dir not open");
            dir.dentries.remove(&old_name);
            dir.is_empty()
        };
        if now_empty {
            self.close_dir(old_dir);
        }
        let d = self.dentry_mut(dn);
        d.name = new_name.to_string();
        d.dir = new_dir;
    }

    /// Makes the child table of `ino` resident. Idempotent; the first call
    /// takes a ref and pins the parent dentry.
    pub fn open_dir(&mut self, ino: u64) {
        let pdn = {
            let inode = self.inodes.get_mut(&ino).expect("open_dir: unknown inode");
            if inode.dir.is_some() {
                return;
            }
            inode.dir = Some(Dir::new(ino));
            inode.refs += 1;
            inode.dn
        };
        trace!("open_dir {:x}", ino);
        if let Some(dn) = pdn {
            self.dentry_mut(dn).pinned = true;
            self.lru.pin(dn);
        }
    }

    /// Drops the (empty) child table of `ino`, unpinning its dentry and
    /// releasing the dir's ref.
    pub fn close_dir(&mut self, ino: u64) {
        trace!("close_dir {:x}", ino);
        let pdn = {
            let inode = self.inodes.get_mut(&ino).expect("close_dir: unknown inode");
            let dir = inode.dir.take().expect("close_dir: dir not open");
            assert!(dir.is_empty(), "close_dir: dir {:x} not empty", ino);
            inode.dn
        };
        if let Some(dn) = pdn {
            self.dentry_mut(dn).pinned = false;
            self.lru.unpin(dn);
        }
        self.put_inode(ino);
    }

    pub fn get_inode(&mut self, ino: u64) {
        self.inodes
            .get_mut(&ino)
            .expect("get_inode: unknown inode")
            .refs += 1;
    }

    /// Drops one ref; on the last one the inode leaves the index.
    pub fn put_inode(&mut self, ino: u64) {
        let gone = {
            let inode = self.inodes.get_mut(&ino).expect("put_inode: unknown inode");
            inode.refs -= 1;
            assert!(inode.refs >= 0, "inode {:x} ref underflow", ino);
            inode.refs == 0
        };
        if gone {
            let inode = self.inodes.remove(&ino).unwrap();
            assert!(inode.dn.is_none() && inode.dir.is_none());
            if !inode.caps.is_empty() {
                debug!("dropping inode {:x} with caps still recorded", ino);
            }
            if self.root == Some(ino) {
                self.root = None;
            }
            trace!("dropped inode {:x}", ino);
        }
    }

    pub fn lookup(&self, dir_ino: u64, name: &str) -> Option<DentryId> {
        self.inodes
            .get(&dir_ino)?
            .dir
            .as_ref()?
            .dentries
            .get(name)
            .copied()
    }

    pub fn touch(&mut self, dn: DentryId) {
        self.lru.touch(dn);
    }

    /// Splices one `(name, inode)` step under `dir_ino`, reconciling any
    /// conflicting edges, and returns the child's ino.
    fn splice_child(&mut self, dir_ino: u64, name: &str, info: &InodeInfo) -> u64 {
        let ino = info.attr.ino;
        self.open_dir(dir_ino);
        if let Some(dn) = self.lookup(dir_ino, name) {
            if self.dentry(dn).ino != ino {
                // the name moved to another inode; drop the stale edge
                self.unlink(dn);
            }
        }
        match self.inodes.get_mut(&ino) {
            Some(inode) => inode.update_from(info),
            None => {
                self.inodes.insert(ino, Inode::new(info));
            }
        }
        match self.lookup(dir_ino, name) {
            Some(dn) => {
                self.lru.touch(dn);
            }
            None => {
                if let Some(odn) = self.inodes[&ino].dn {
                    // the inode is cached under another name; move it here
                    self.relink(odn, dir_ino, name);
                    self.lru.touch(odn);
                } else {
                    self.link(dir_ino, name, ino);
                }
            }
        }
        ino
    }

    /// Splices a reply trace (root first) into the cache and returns the
    /// terminal ino. This is the only path by which new inodes appear.
    pub fn insert_trace(&mut self, steps: &[TraceStep]) -> u64 {
        assert!(!steps.is_empty());
        let rinfo = &steps[0].info;
        let rino = rinfo.attr.ino;
        match self.root {
            Some(existing) => {
                debug_assert_eq!(existing, rino, "root ino changed");
                self.inodes.get_mut(&rino).unwrap().update_from(rinfo);
            }
            None => {
                let mut inode = Inode::new(rinfo);
                inode.refs = 1; // the dedicated root hold
                self.inodes.insert(rino, inode);
                self.root = Some(rino);
                debug!("cached root inode {:x}", rino);
            }
        }
        let mut cur = rino;
        for step in &steps[1..] {
            cur = self.splice_child(cur, &step.name, &step.info);
        }
        cur
    }

    /// Splices a directory listing under an already-cached dir inode.
    pub fn insert_readdir(&mut self, dir_ino: u64, entries: &[(String, InodeInfo)]) {
        for (name, info) in entries {
            self.splice_child(dir_ino, name, info);
        }
    }

    /// Evicts cold dentries until the LRU fits its max or only pinned
    /// entries remain.
    pub fn trim(&mut self) {
        while self.lru.size() > self.lru.max() {
            match self.lru.expire() {
                Some(dn) => {
                    let d = self.dentry(dn);
                    trace!("trim: expiring {:x}/{}", d.dir, d.name);
                    self.unlink(dn);
                }
                None => break,
            }
        }
    }

    /// Unmount teardown: evict everything evictable.
    pub fn clear(&mut self) {
        let max = self.lru.max();
        self.lru.set_max(0);
        self.trim();
        self.lru.set_max(max);
    }

    /// The MDS holding authority for `ino`: its own hint, else the nearest
    /// ancestor's, else the default.
    pub fn authority(&self, ino: u64) -> usize {
        let mut cur = ino;
        loop {
            let Some(inode) = self.inodes.get(&cur) else {
                return MDS_ROOT;
            };
            if let Some(auth) = inode.dir_auth {
                return auth;
            }
            match inode.dn {
                Some(dn) => cur = self.dentry(dn).dir,
                None => return MDS_ROOT,
            }
        }
    }

    pub fn dump(&self) {
        debug!(
            "cache: {} inodes, {} dentries, lru {}/{}",
            self.inodes.len(),
            self.num_dentries(),
            self.lru.size(),
            self.lru.max()
        );
        for (ino, inode) in &self.inodes {
            debug!(
                "  ino {:x} refs {} r/w {}/{} caps {:?} stale {:?} dir {} dn {:?}",
                ino,
                inode.refs,
                inode.num_readers,
                inode.num_writers,
                inode.cur_caps(),
                inode.file_caps() - inode.cur_caps(),
                inode.dir.is_some(),
                inode.dn,
            );
        }
    }

    /// Asserts the graph invariants. `fh_refs` carries the per-ino count of
    /// open handles, which the cache cannot see on its own.
    pub fn verify(&self, fh_refs: &BTreeMap<u64, i32>) {
        let mut edge_refs: BTreeMap<u64, i32> = BTreeMap::new();
        let mut live = 0;
        for (idx, slot) in self.dentries.iter().enumerate() {
            let Some(d) = slot else { continue };
            live += 1;
            let dir_inode = self.inodes.get(&d.dir).expect("dentry under unknown dir");
            let dir = dir_inode.dir.as_ref().expect("dentry in a closed dir");
            assert_eq!(dir.dentries.get(&d.name).copied(), Some(idx));
            let target = self.inodes.get(&d.ino).expect("dentry to unknown inode");
            assert_eq!(target.dn, Some(idx));
            *edge_refs.entry(d.ino).or_insert(0) += 1;
            assert_eq!(d.pinned, target.dir.is_some());
            assert_eq!(self.lru.is_pinned(idx), d.pinned);
            assert!(self.lru.contains(idx));
        }
        assert_eq!(self.lru.size(), live);
        for (&ino, inode) in &self.inodes {
            if let Some(dir) = &inode.dir {
                assert_eq!(dir.parent, ino);
                assert!(!dir.is_empty(), "resident dir {:x} is empty", ino);
                for (name, &dn) in &dir.dentries {
                    let d = self.dentry(dn);
                    assert_eq!((d.dir, d.name.as_str()), (ino, name.as_str()));
                }
            }
            if let Some(dn) = inode.dn {
                assert_eq!(self.dentry(dn).ino, ino);
            }
            for mds in inode.caps.keys() {
                assert!(!inode.stale_caps.contains_key(mds));
            }
            let mut expect = edge_refs.get(&ino).copied().unwrap_or(0);
            if inode.dir.is_some() {
                expect += 1;
            }
            if self.root == Some(ino) {
                expect += 1;
            }
            expect += fh_refs.get(&ino).copied().unwrap_or(0);
            assert_eq!(inode.refs, expect, "inode {:x} ref mismatch", ino);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::StatMode;
    use crate::message::{InodeAttr, TimeSpec};
    use crate::path::FilePath;

    fn info(ino: u64, is_dir: bool) -> InodeInfo {
        let mode = if is_dir {
            StatMode::S_IFDIR | StatMode::S_IRWXU
        } else {
            StatMode::S_IFREG | StatMode::S_IRWXU
        };
        InodeInfo {
            attr: InodeAttr {
                ino,
                mode,
                nlink: 1,
                uid: 0,
                gid: 0,
                size: 0,
                atime: TimeSpec::default(),
                mtime: TimeSpec::default(),
                ctime: TimeSpec::default(),
            },
            symlink: None,
            dir_auth: None,
            replicas: Vec::new(),
        }
    }

    fn step(name: &str, ino: u64, is_dir: bool) -> TraceStep {
        TraceStep {
            name: name.to_string(),
            info: info(ino, is_dir),
        }
    }

    fn none() -> BTreeMap<u64, i32> {
        BTreeMap::new()
    }

    #[test]
    fn test_trace_and_resolve() {
        let mut cache = MetaCache::new(64);
        let trace = [step("", 1, true), step("a", 2, true), step("b", 3, false)];
        assert_eq!(cache.insert_trace(&trace), 3);
        cache.verify(&none());
        assert_eq!(cache.root(), Some(1));
        match cache.resolve(&FilePath::new("/a/b")) {
            Resolved::Hit { ino, dn } => {
                assert_eq!(ino, 3);
                assert!(dn.is_some());
            }
            _ => panic!("expected hit"),
        }
        match cache.resolve(&FilePath::new("/a/c")) {
            Resolved::Miss { deepest, remaining } => {
                assert_eq!(deepest, 2);
                assert_eq!(remaining, 1);
            }
            _ => panic!("expected miss"),
        }
    }

    #[test]
    fn test_trace_idempotent() {
        let mut cache = MetaCache::new(64);
        let trace = [step("", 1, true), step("a", 2, true), step("b", 3, false)];
        cache.insert_trace(&trace);
        let refs: Vec<i32> = cache.inos().iter().map(|i| cache.inode(*i).unwrap().refs).collect();
        let dentries = cache.num_dentries();
        cache.insert_trace(&trace);
        cache.verify(&none());
        let refs2: Vec<i32> = cache.inos().iter().map(|i| cache.inode(*i).unwrap().refs).collect();
        assert_eq!(refs, refs2);
        assert_eq!(dentries, cache.num_dentries());
    }

    #[test]
    fn test_unlink_closes_empty_dir() {
        let mut cache = MetaCache::new(64);
        cache.insert_trace(&[step("", 1, true), step("a", 2, true), step("b", 3, false)]);
        // dir "a" is resident (it holds "b"); its dentry is pinned
        let a_dn = cache.lookup(1, "a").unwrap();
        assert!(cache.dentry(a_dn).pinned);
        let b_dn = cache.lookup(2, "b").unwrap();
        cache.unlink(b_dn);
        cache.verify(&none());
        // last unlink closed "a"'s dir and unpinned its dentry
        assert!(cache.inode(2).unwrap().dir.is_none());
        assert!(!cache.dentry(a_dn).pinned);
        assert!(cache.inode(3).is_none(), "unreferenced inode must drop");
        cache.unlink(a_dn);
        cache.verify(&none());
        assert_eq!(cache.num_inodes(), 1); // only the root hold remains
    }

    #[test]
    fn test_link_unlink_round_trip() {
        let mut cache = MetaCache::new(64);
        cache.insert_trace(&[step("", 1, true), step("a", 2, true), step("b", 3, false)]);
        // hold ino 3 the way an open handle would, then drop its edge
        cache.get_inode(3);
        let mut fh_refs = BTreeMap::new();
        fh_refs.insert(3, 1);
        let b_dn = cache.lookup(2, "b").unwrap();
        cache.unlink(b_dn);
        cache.verify(&fh_refs);
        assert!(cache.inode(3).unwrap().dn.is_none());
        let root_refs = cache.inode(1).unwrap().refs;
        // link then unlink the same (dir, name, inode) restores prior state
        let dn = cache.link(1, "g", 3);
        cache.verify(&fh_refs);
        assert_eq!(cache.inode(3).unwrap().refs, 2);
        cache.unlink(dn);
        cache.verify(&fh_refs);
        assert_eq!(cache.inode(1).unwrap().refs, root_refs);
        assert_eq!(cache.inode(3).unwrap().refs, 1);
        cache.put_inode(3);
        cache.verify(&none());
        assert!(cache.inode(3).is_none());
    }

    #[test]
    fn test_rename_via_trace_relinks() {
        let mut cache = MetaCache::new(64);
        cache.insert_trace(&[step("", 1, true), step("x", 2, true), step("f", 4, false)]);
        cache.insert_trace(&[step("", 1, true), step("y", 3, true), step("g", 5, false)]);
        let f_refs = cache.inode(4).unwrap().refs;
        // the MDS answers a rename with the trace of the new location
        cache.insert_trace(&[step("", 1, true), step("y", 3, true), step("f", 4, false)]);
        cache.verify(&none());
        assert!(cache.lookup(3, "f").is_some());
        assert!(cache.lookup(2, "f").is_none());
        assert_eq!(cache.inode(4).unwrap().refs, f_refs);
        // x emptied out, so its dir closed
        assert!(cache.inode(2).unwrap().dir.is_none());
    }

    #[test]
    fn test_trace_replaces_moved_name() {
        let mut cache = MetaCache::new(64);
        cache.insert_trace(&[step("", 1, true), step("a", 2, true), step("b", 3, false)]);
        // the name now leads to a different inode
        cache.insert_trace(&[step("", 1, true), step("a", 2, true), step("b", 7, false)]);
        cache.verify(&none());
        let dn = cache.lookup(2, "b").unwrap();
        assert_eq!(cache.dentry(dn).ino, 7);
        assert!(cache.inode(3).is_none());
    }

    #[test]
    fn test_trim_respects_pins() {
        let mut cache = MetaCache::new(64);
        // chain /a/b/c/d/e/f: every intermediate dir is open, so only the
        // leaf dentry is evictable at first
        cache.insert_trace(&[
            step("", 1, true),
            step("a", 2, true),
            step("b", 3, true),
            step("c", 4, true),
            step("d", 5, true),
            step("e", 6, true),
            step("f", 7, false),
        ]);
        cache.lru.set_max(3);
        cache.trim();
        cache.verify(&none());
        // eviction collapsed bottom-up and stopped at the cap
        assert_eq!(cache.lru.size(), 3);
        assert!(cache.lookup(1, "a").is_some());
        assert!(cache.lookup(2, "b").is_some());
        assert!(cache.lookup(3, "c").is_some());
        assert!(cache.lookup(4, "d").is_none());
    }

    #[test]
    fn test_clear_collapses_bottom_up() {
        let mut cache = MetaCache::new(64);
        cache.insert_trace(&[
            step("", 1, true),
            step("a", 2, true),
            step("b", 3, true),
            step("c", 4, false),
        ]);
        cache.clear();
        cache.verify(&none());
        assert_eq!(cache.lru.size(), 0);
        // every dir closed on its last unlink; only the root hold survives
        assert_eq!(cache.num_inodes(), 1);
        assert!(cache.inode(1).unwrap().dir.is_none());
    }

    #[test]
    fn test_authority_walk() {
        let mut cache = MetaCache::new(64);
        let mut t = [step("", 1, true), step("a", 2, true), step("b", 3, false)];
        t[1].info.dir_auth = Some(2);
        cache.insert_trace(&t);
        // b has no hint; it inherits from a through the parent chain
        assert_eq!(cache.authority(3), 2);
        assert_eq!(cache.authority(2), 2);
        assert_eq!(cache.authority(1), MDS_ROOT);
    }
}
