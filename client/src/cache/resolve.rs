//! Cache-only path resolution.

use super::{DentryId, MetaCache};
use crate::path::FilePath;

/// Outcome of a cache walk.
#[derive(Debug)]
pub enum Resolved {
    /// The whole path is cached. The root resolves with no dentry.
    Hit { dn: Option<DentryId>, ino: u64 },
    /// The walk stopped at `deepest`; `remaining` indexes the first
    /// unresolved component.
    Miss { deepest: u64, remaining: usize },
}

impl MetaCache {
    /// Walks `path` against the cache. Promotes traversed dentries; never
    /// blocks and never contacts the cluster. A miss is the caller's cue to
    /// escalate through the request pipeline and retry.
    pub fn resolve(&mut self, path: &FilePath) -> Resolved {
        let mut cur = self.root().expect("resolve with no root");
        let mut dn = None;
        for (i, name) in path.components().into_iter().enumerate() {
            match self.lookup(cur, name) {
                Some(d) => {
                    self.touch(d);
                    cur = self.dentry(d).ino;
                    dn = Some(d);
                }
                None => {
                    return Resolved::Miss {
                        deepest: cur,
                        remaining: i,
                    }
                }
            }
        }
        Resolved::Hit { dn, ino: cur }
    }

    /// The terminal dentry of a fully cached path.
    pub fn lookup_path(&mut self, path: &FilePath) -> Option<DentryId> {
        match self.resolve(path) {
            Resolved::Hit { dn, .. } => dn,
            Resolved::Miss { .. } => None,
        }
    }
}
