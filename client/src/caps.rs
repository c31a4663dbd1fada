//! File capabilities.
//!
//! Each MDS that granted access to an inode contributes one [`InodeCap`]
//! record. Incoming cap messages are ordered per `(ino, mds)` by `seq`;
//! anything that does not advance the seq is stale and dropped. A revoke
//! that would strand dirty buffers is parked on the reap queue and only
//! acknowledged once the flush coordinator drains the inode.

use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, warn};

use crate::client::{Client, ClientInner};
use crate::config::CAP_WAIT_MS;
use crate::message::{CapOp, FileCaps, Message};

bitflags! {
    /// Operations an MDS has granted on a file.
    pub struct CapMask: u32 {
        const RD = 0x0001;
        const RDCACHE = 0x0002;
        const WR = 0x0004;
        const WRBUFFER = 0x0008;
        const WREXTEND = 0x0010;
        const EXCL = 0x0020;
    }
}

/// The grant state of one MDS on one inode.
#[derive(Debug, Clone, Copy)]
pub struct InodeCap {
    pub caps: CapMask,
    pub seq: u64,
}

/// Applies a grant-message downgrade that is safe to take now: shrinks or
/// retires the record and queues the acknowledgement.
pub(crate) fn apply_cap_downgrade(inner: &mut ClientInner, m: &FileCaps) {
    let old = match inner.cache.inode(m.ino).and_then(|i| i.caps.get(&m.mds)) {
        Some(cap) => cap.caps,
        None => return,
    };
    if (old - m.caps).intersects(CapMask::RDCACHE) {
        inner.bcache.invalidate_clean(m.ino);
    }
    let ack = {
        let inode = inner.cache.inode_mut(m.ino).unwrap();
        if m.caps.is_empty() {
            // keep the old mask as read-only grace state
            inode.caps.remove(&m.mds);
            inode
                .stale_caps
                .insert(m.mds, InodeCap { caps: old, seq: m.seq });
        } else {
            let cap = inode.caps.get_mut(&m.mds).unwrap();
            cap.caps = m.caps;
            cap.seq = m.seq;
        }
        FileCaps {
            op: CapOp::Ack,
            ino: m.ino,
            seq: m.seq,
            caps: m.caps,
            wanted: inode.wanted(),
            size: inode.attr.size,
            mds: m.mds,
        }
    };
    inner.outbox.push((m.mds, Message::FileCaps(ack)));
}

impl Client {
    /// Handles an incoming cap grant/revoke. Runs from `dispatch`, which
    /// drains the outbox afterwards.
    pub(crate) fn handle_file_caps(self: &Arc<Self>, m: FileCaps) {
        if m.op != CapOp::Grant {
            warn!("unexpected cap op {:?} from mds{}", m.op, m.mds);
            return;
        }
        let mut inner = self.lock();
        let dirty = inner.bcache.has_uncommitted(m.ino);
        if inner.cache.inode(m.ino).is_none() {
            drop(inner);
            warn!("file caps for unknown ino {:x}, dropping", m.ino);
            return;
        }
        let state = {
            let inode = inner.cache.inode(m.ino).unwrap();
            if let Some(cap) = inode.caps.get(&m.mds) {
                Some((false, cap.caps, cap.seq))
            } else {
                inode
                    .stale_caps
                    .get(&m.mds)
                    .map(|cap| (true, cap.caps, cap.seq))
            }
        };
        match state {
            Some((_, _, seq)) if m.seq <= seq => {
                debug!(
                    "ino {:x} mds{} cap seq {} <= {}, dropping",
                    m.ino, m.mds, m.seq, seq
                );
                return;
            }
            Some((true, _, _)) => {
                // the MDS came back; its re-issue supersedes the stale record
                let inode = inner.cache.inode_mut(m.ino).unwrap();
                inode.stale_caps.remove(&m.mds);
                if !m.caps.is_empty() {
                    inode
                        .caps
                        .insert(m.mds, InodeCap { caps: m.caps, seq: m.seq });
                }
            }
            Some((false, old, _)) => {
                if old.contains(m.caps) && old != m.caps {
                    if (old - m.caps).intersects(CapMask::WRBUFFER) && dirty {
                        debug!(
                            "ino {:x}: mds{} revokes {:?} while dirty, deferring ack",
                            m.ino,
                            m.mds,
                            old - m.caps
                        );
                        inner.cap_reap.insert((m.ino, m.mds), m.clone());
                        drop(inner);
                        self.kick_flush(m.ino);
                        return;
                    }
                    apply_cap_downgrade(&mut inner, &m);
                } else {
                    // grant or lateral change, no ack owed
                    let inode = inner.cache.inode_mut(m.ino).unwrap();
                    let cap = inode.caps.get_mut(&m.mds).unwrap();
                    cap.caps = m.caps;
                    cap.seq = m.seq;
                }
            }
            None => {
                if m.caps.is_empty() {
                    return;
                }
                inner
                    .cache
                    .inode_mut(m.ino)
                    .unwrap()
                    .caps
                    .insert(m.mds, InodeCap { caps: m.caps, seq: m.seq });
            }
        }
        self.update_caps_wanted(&mut inner, m.ino);
        self.cond.notify_all();
    }

    /// Reports a changed wanted mask to every MDS we hold state with.
    /// Contiguous updates with the same mask are coalesced away.
    pub(crate) fn update_caps_wanted(&self, inner: &mut ClientInner, ino: u64) {
        let msgs = {
            let Some(inode) = inner.cache.inode_mut(ino) else {
                return;
            };
            let wanted = inode.wanted();
            if wanted == inode.last_wanted {
                return;
            }
            inode.last_wanted = wanted;
            let size = inode.attr.size;
            inode
                .caps
                .iter()
                .chain(inode.stale_caps.iter())
                .map(|(&mds, cap)| {
                    (
                        mds,
                        FileCaps {
                            op: CapOp::Wanted,
                            ino,
                            seq: cap.seq,
                            caps: cap.caps,
                            wanted,
                            size,
                            mds,
                        },
                    )
                })
                .collect::<Vec<_>>()
        };
        for (mds, m) in msgs {
            inner.outbox.push((mds, Message::FileCaps(m)));
        }
    }

    /// Voluntarily drops every held bit not in `retain`, flushing and
    /// invalidating whatever the dropped bits covered first.
    pub(crate) fn release_caps<'a>(
        self: &'a Arc<Self>,
        mut inner: MutexGuard<'a, ClientInner>,
        ino: u64,
        retain: CapMask,
    ) -> MutexGuard<'a, ClientInner> {
        let held = match inner.cache.inode(ino) {
            Some(inode) => inode.file_caps(),
            None => return inner,
        };
        let dropping = held - retain;
        if dropping.is_empty() {
            return inner;
        }
        debug!("ino {:x}: releasing {:?}, retaining {:?}", ino, dropping, retain);
        if dropping.intersects(CapMask::WRBUFFER) {
            inner = self.flush_inode_buffers(inner, ino);
        }
        if dropping.intersects(CapMask::RDCACHE) {
            inner.bcache.invalidate_clean(ino);
        }
        let msgs = {
            let inode = inner.cache.inode_mut(ino).unwrap();
            let wanted = inode.wanted();
            let size = inode.attr.size;
            let mut msgs = Vec::new();
            let mut drop_mds = Vec::new();
            for (&mds, cap) in inode.caps.iter_mut() {
                let keep = cap.caps & retain;
                if keep == cap.caps {
                    continue;
                }
                msgs.push((
                    mds,
                    FileCaps {
                        op: CapOp::Release,
                        ino,
                        seq: cap.seq,
                        caps: keep,
                        wanted,
                        size,
                        mds,
                    },
                ));
                if keep.is_empty() {
                    drop_mds.push(mds);
                } else {
                    cap.caps = keep;
                }
            }
            for mds in drop_mds {
                inode.caps.remove(&mds);
            }
            // a release also scrubs stale grace state it covers
            inode.stale_caps.retain(|_, cap| (cap.caps - retain).is_empty());
            msgs
        };
        for (mds, m) in msgs {
            inner.outbox.push((mds, Message::FileCaps(m)));
        }
        inner
    }

    /// Waits (bounded) for `need` bits from `mds`, asking for a re-issue
    /// first. Returns whether the bits arrived. The forced wanted update is
    /// sent even when the derived mask did not change: a blocked operation
    /// must announce itself before parking.
    pub(crate) fn await_caps<'a>(
        self: &'a Arc<Self>,
        mut inner: MutexGuard<'a, ClientInner>,
        ino: u64,
        mds: usize,
        need: CapMask,
    ) -> (MutexGuard<'a, ClientInner>, bool) {
        let have =
            |inner: &ClientInner| inner.cache.inode(ino).map(|i| i.mds_caps(mds)).unwrap_or_else(CapMask::empty);
        if have(&inner).contains(need) {
            return (inner, true);
        }
        if inner.cache.inode(ino).is_none() {
            return (inner, false);
        }
        let msg = {
            let inode = inner.cache.inode(ino).unwrap();
            let cap = inode
                .caps
                .get(&mds)
                .or_else(|| inode.stale_caps.get(&mds))
                .copied()
                .unwrap_or(InodeCap {
                    caps: CapMask::empty(),
                    seq: 0,
                });
            FileCaps {
                op: CapOp::Wanted,
                ino,
                seq: cap.seq,
                caps: cap.caps,
                wanted: inode.wanted() | need,
                size: inode.attr.size,
                mds,
            }
        };
        inner.outbox.push((mds, Message::FileCaps(msg)));
        drop(inner);
        self.drain_outbox();
        let mut inner = self.lock();
        let deadline = Instant::now() + Duration::from_millis(CAP_WAIT_MS);
        while !have(&inner).contains(need) {
            let now = Instant::now();
            if now >= deadline {
                return (inner, false);
            }
            let (g, _) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .expect("client lock poisoned");
            inner = g;
        }
        (inner, true)
    }
}
