//! The metadata request pipeline.
//!
//! `make_request` picks candidate MDSs, sends outside the client lock,
//! parks the caller on the pending table until `dispatch` fills its slot,
//! and splices the reply trace into the cache before the caller resumes.

use std::sync::{Arc, MutexGuard};

use errno::Errno;
use log::{trace, warn};

use crate::client::{Client, ClientInner};
use crate::config::MDS_ROOT;
use crate::message::{Message, MetaArg, MetaOp, MetaReply, MetaRequest};
use crate::path::FilePath;
use crate::Resolved;

impl Client {
    /// Candidate MDSs for a request, best first.
    ///
    /// A pinned target wins outright; otherwise the authority of the
    /// deepest cached inode on the path, alone when the request must reach
    /// the authority, after the known replicas when any replica will do.
    fn route(inner: &mut ClientInner, path: &FilePath, auth_best: bool, use_auth: Option<usize>) -> Vec<usize> {
        if let Some(mds) = use_auth {
            return vec![mds];
        }
        if inner.cache.root().is_none() {
            return vec![MDS_ROOT];
        }
        let deepest = match inner.cache.resolve(path) {
            Resolved::Hit { ino, .. } => ino,
            Resolved::Miss { deepest, .. } => deepest,
        };
        let auth = inner.cache.authority(deepest);
        if auth_best {
            return vec![auth];
        }
        let mut candidates: Vec<usize> = inner
            .cache
            .inode(deepest)
            .map(|i| i.replicas.clone())
            .unwrap_or_default();
        if !candidates.contains(&auth) {
            candidates.push(auth);
        }
        candidates
    }

    /// Sends a metadata request and blocks until a reply arrives, retrying
    /// the next candidate when the transport rejects the send. The reply
    /// trace is spliced under the lock before returning.
    pub(crate) fn make_request<'a>(
        self: &'a Arc<Self>,
        mut inner: MutexGuard<'a, ClientInner>,
        op: MetaOp,
        path: FilePath,
        arg: MetaArg,
        auth_best: bool,
        use_auth: Option<usize>,
    ) -> (MutexGuard<'a, ClientInner>, Result<MetaReply, Errno>) {
        let tid = inner.next_tid;
        inner.next_tid += 1;
        let candidates = Self::route(&mut inner, &path, auth_best, use_auth);
        inner.pending.insert(tid, None);
        let req = MetaRequest { tid, op, path, arg };
        drop(inner);

        let mut reply = None;
        for mds in candidates {
            trace!("request {} {:?} -> mds{}", tid, req.op, mds);
            if let Err(e) = self.messenger.send(mds, Message::Request(req.clone())) {
                warn!("mds{} unreachable ({:?}), trying next candidate", mds, e);
                continue;
            }
            let mut g = self.lock();
            while g.pending.get(&tid).map_or(false, |slot| slot.is_none()) {
                g = self.cond_wait(g);
            }
            reply = g.pending.get_mut(&tid).and_then(|slot| slot.take());
            drop(g);
            break;
        }

        let mut inner = self.lock();
        inner.pending.remove(&tid);
        let Some(reply) = reply else {
            return (inner, Err(Errno::ENOTCONN));
        };
        if reply.result.is_ok() && !reply.trace.is_empty() {
            inner.cache.insert_trace(&reply.trace);
            inner.cache.trim();
        }
        trace!("request {} -> {:?} from mds{}", tid, reply.result, reply.mds);
        match reply.result {
            Ok(()) => (inner, Ok(reply)),
            Err(e) => (inner, Err(e)),
        }
    }

    /// Entry point for every message coming off the wire or the dispatch
    /// queue. Always entered with the client lock free.
    pub fn dispatch(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::Reply(reply) => {
                let mut inner = self.lock();
                match inner.pending.get_mut(&reply.tid) {
                    Some(slot) => {
                        *slot = Some(reply);
                        self.cond.notify_all();
                    }
                    None => warn!("reply for unknown tid {}, dropping", reply.tid),
                }
            }
            Message::FileCaps(m) => {
                self.handle_file_caps(m);
                self.drain_outbox();
            }
            Message::OsdMap(map) => {
                let forward = {
                    let mut inner = self.lock();
                    if map.epoch > inner.osd_epoch {
                        inner.osd_epoch = map.epoch;
                        true
                    } else {
                        false
                    }
                };
                if forward {
                    self.filer.handle_osd_map(map);
                }
            }
            Message::Request(req) => warn!("client received a request ({:?}), dropping", req.op),
        }
    }
}
