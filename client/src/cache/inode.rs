//! Cache graph entities.
//!
//! Ownership runs one way: the cache owns every [`Inode`], an inode owns its
//! resident [`Dir`], a dir owns its [`Dentry`] edges (by arena id). The
//! inode's pointer back to its parent dentry is a bare id that is nulled
//! when the dentry dies; only the numeric `refs` count keeps an inode alive.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::caps::{CapMask, InodeCap};
use crate::message::{InodeAttr, InodeInfo};

/// Index of a dentry in the cache's arena.
pub type DentryId = usize;

/// Child table of a directory inode. Resident only while it has entries
/// (a transient empty dir exists between opening and the first link).
#[derive(Debug)]
pub struct Dir {
    /// The inode this child table belongs to.
    pub parent: u64,
    pub dentries: BTreeMap<String, DentryId>,
}

impl Dir {
    pub fn new(parent: u64) -> Self {
        Self {
            parent,
            dentries: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dentries.is_empty()
    }
}

/// A named edge from a dir to an inode.
#[derive(Debug)]
pub struct Dentry {
    /// Ino of the owning directory inode.
    pub dir: u64,
    pub name: String,
    /// Ino of the target inode.
    pub ino: u64,
    /// Set exactly while the target inode has an open dir; the dentry is
    /// then excluded from eviction.
    pub pinned: bool,
}

/// A file, directory, or symlink known to the client.
pub struct Inode {
    pub attr: InodeAttr,
    pub symlink: Option<String>,
    pub dir: Option<Dir>,
    /// Parent dentry, if a path edge to this inode is cached. Weak: carries
    /// no reference count, nulled when the dentry goes away.
    pub dn: Option<DentryId>,
    /// Current grants, per MDS.
    pub caps: BTreeMap<usize, InodeCap>,
    /// Grants from MDSs that revoked or went silent; usable only as a
    /// read-only grace state, never for new operations.
    pub stale_caps: BTreeMap<usize, InodeCap>,
    /// Replica MDS ids that may serve reads.
    pub replicas: Vec<usize>,
    /// Authority hint for the directory tree this inode belongs to.
    pub dir_auth: Option<usize>,
    pub last_updated: Instant,
    /// Highest offset we have written through this client.
    pub wr_max_offset: u64,
    pub wr_last: Option<Instant>,
    pub num_readers: u32,
    pub num_writers: u32,
    /// dentry edge + open handles + open dir + root hold.
    pub refs: i32,
    /// Last wanted mask reported to the cluster, for coalescing.
    pub last_wanted: CapMask,
}

impl Inode {
    pub fn new(info: &InodeInfo) -> Self {
        Self {
            attr: info.attr.clone(),
            symlink: info.symlink.clone(),
            dir: None,
            dn: None,
            caps: BTreeMap::new(),
            stale_caps: BTreeMap::new(),
            replicas: info.replicas.clone(),
            dir_auth: info.dir_auth,
            last_updated: Instant::now(),
            wr_max_offset: 0,
            wr_last: None,
            num_readers: 0,
            num_writers: 0,
            refs: 0,
            last_wanted: CapMask::empty(),
        }
    }

    pub fn ino(&self) -> u64 {
        self.attr.ino
    }

    /// Everything we are currently entitled to exercise, grace bits
    /// included.
    pub fn file_caps(&self) -> CapMask {
        self.caps
            .values()
            .chain(self.stale_caps.values())
            .fold(CapMask::empty(), |m, c| m | c.caps)
    }

    /// Bits backed by a live MDS session; new operations need these.
    pub fn cur_caps(&self) -> CapMask {
        self.caps
            .values()
            .fold(CapMask::empty(), |m, c| m | c.caps)
    }

    /// Current grant from one specific MDS.
    pub fn mds_caps(&self, mds: usize) -> CapMask {
        self.caps
            .get(&mds)
            .map(|c| c.caps)
            .unwrap_or_else(CapMask::empty)
    }

    /// The mask this client wants, derived from open state.
    pub fn wanted(&self) -> CapMask {
        let mut w = CapMask::empty();
        if self.num_readers > 0 {
            w |= CapMask::RD | CapMask::RDCACHE;
        }
        if self.num_writers > 0 {
            w |= CapMask::WR | CapMask::WRBUFFER;
        }
        w
    }

    /// Refreshes cached metadata from a reply trace, leaving refs, caps,
    /// open dir and parent edge alone. While we hold WR the reported size
    /// never regresses below what we wrote ourselves.
    pub fn update_from(&mut self, info: &InodeInfo) {
        debug_assert_eq!(self.attr.ino, info.attr.ino);
        let mut attr = info.attr.clone();
        if self.file_caps().contains(CapMask::WR) && self.wr_max_offset > attr.size {
            attr.size = self.wr_max_offset;
        }
        self.attr = attr;
        self.symlink = info.symlink.clone();
        if info.dir_auth.is_some() {
            self.dir_auth = info.dir_auth;
        }
        for r in &info.replicas {
            if !self.replicas.contains(r) {
                self.replicas.push(*r);
            }
        }
        self.last_updated = Instant::now();
    }
}
