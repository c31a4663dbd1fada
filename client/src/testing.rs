//! An in-process single-node cluster: a mock MDS owning an authoritative
//! namespace, a mock object store, and a loopback messenger that delivers
//! replies synchronously from inside `send`.
//!
//! Exists for tests and demos; nothing here touches a real network.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use errno::Errno;
use log::trace;

use crate::caps::CapMask;
use crate::client::Client;
use crate::config::ROOT_INO;
use crate::filer::{Filer, OsdMap, ReadCallback, WriteCallback};
use crate::flags::{OpenFlags, StatMode};
use crate::message::{
    CapOp, FileCaps, InodeAttr, InodeInfo, Message, Messenger, MetaArg, MetaOp, MetaReply,
    MetaRequest, ReplyData, StatFs, TimeSpec, TraceStep,
};
use crate::path::FilePath;

struct Node {
    attr: InodeAttr,
    symlink: Option<String>,
    children: BTreeMap<String, u64>,
}

impl Node {
    fn is_dir(&self) -> bool {
        self.attr.mode.is_dir()
    }
}

struct Namespace {
    nodes: BTreeMap<u64, Node>,
    next_ino: u64,
}

fn attr(ino: u64, mode: StatMode) -> InodeAttr {
    InodeAttr {
        ino,
        mode,
        nlink: 1,
        uid: 0,
        gid: 0,
        size: 0,
        atime: TimeSpec::default(),
        mtime: TimeSpec::default(),
        ctime: TimeSpec::default(),
    }
}

impl Namespace {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_INO,
            Node {
                attr: attr(ROOT_INO, StatMode::S_IFDIR | StatMode::S_IRWXU),
                symlink: None,
                children: BTreeMap::new(),
            },
        );
        Self {
            nodes,
            next_ino: ROOT_INO + 1,
        }
    }

    fn info(&self, ino: u64) -> InodeInfo {
        let node = &self.nodes[&ino];
        InodeInfo {
            attr: node.attr.clone(),
            symlink: node.symlink.clone(),
            dir_auth: Some(0),
            replicas: Vec::new(),
        }
    }

    /// Chain of `(name, ino)` from the root down to the subject.
    fn resolve(&self, path: &FilePath) -> Result<Vec<(String, u64)>, Errno> {
        let mut chain = vec![(String::new(), ROOT_INO)];
        let mut cur = ROOT_INO;
        for name in path.components() {
            let node = &self.nodes[&cur];
            if !node.is_dir() {
                return Err(Errno::ENOTDIR);
            }
            let &child = node.children.get(name).ok_or(Errno::ENOENT)?;
            chain.push((name.to_string(), child));
            cur = child;
        }
        Ok(chain)
    }

    fn trace(&self, chain: &[(String, u64)]) -> Vec<TraceStep> {
        chain
            .iter()
            .map(|(name, ino)| TraceStep {
                name: name.clone(),
                info: self.info(*ino),
            })
            .collect()
    }

    fn create(&mut self, parent: u64, name: &str, mode: StatMode, symlink: Option<String>) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(
            ino,
            Node {
                attr: attr(ino, mode),
                symlink,
                children: BTreeMap::new(),
            },
        );
        let prev = self
            .nodes
            .get_mut(&parent)
            .unwrap()
            .children
            .insert(name.to_string(), ino);
        assert!(prev.is_none());
        ino
    }
}

#[derive(Default)]
struct CapTable {
    seq: BTreeMap<u64, u64>,
    issued: BTreeMap<u64, CapMask>,
}

impl CapTable {
    fn next_seq(&mut self, ino: u64) -> u64 {
        let seq = self.seq.entry(ino).or_insert(0);
        *seq += 1;
        *seq
    }
}

/// The mock MDS plus the loopback transport in one object.
pub struct MockCluster {
    client: Mutex<Option<Arc<Client>>>,
    ns: Mutex<Namespace>,
    caps: Mutex<CapTable>,
    requests: Mutex<Vec<MetaRequest>>,
    cap_msgs: Mutex<Vec<FileCaps>>,
    down: Mutex<BTreeSet<usize>>,
    silent: Mutex<BTreeSet<usize>>,
    regrant: Mutex<bool>,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            client: Mutex::new(None),
            ns: Mutex::new(Namespace::new()),
            caps: Mutex::new(CapTable::default()),
            requests: Mutex::new(Vec::new()),
            cap_msgs: Mutex::new(Vec::new()),
            down: Mutex::new(BTreeSet::new()),
            silent: Mutex::new(BTreeSet::new()),
            regrant: Mutex::new(false),
        })
    }

    pub fn attach(&self, client: &Arc<Client>) {
        *self.client.lock().unwrap() = Some(Arc::clone(client));
    }

    fn dispatch(&self, msg: Message) {
        let client = self.client.lock().unwrap().clone();
        if let Some(client) = client {
            client.dispatch(msg);
        }
    }

    // -- namespace seeding ---------------------------------------------

    pub fn add_dir(&self, path: &str) -> u64 {
        let path = FilePath::new(path);
        let mut ns = self.ns.lock().unwrap();
        let parent = ns.resolve(&path.parent()).unwrap().last().unwrap().1;
        ns.create(
            parent,
            path.last().unwrap(),
            StatMode::S_IFDIR | StatMode::S_IRWXU,
            None,
        )
    }

    pub fn add_file(&self, path: &str, size: u64) -> u64 {
        let path = FilePath::new(path);
        let mut ns = self.ns.lock().unwrap();
        let parent = ns.resolve(&path.parent()).unwrap().last().unwrap().1;
        let ino = ns.create(
            parent,
            path.last().unwrap(),
            StatMode::S_IFREG | StatMode::S_IRWXU,
            None,
        );
        ns.nodes.get_mut(&ino).unwrap().attr.size = size;
        ino
    }

    pub fn add_symlink(&self, path: &str, target: &str) -> u64 {
        let path = FilePath::new(path);
        let mut ns = self.ns.lock().unwrap();
        let parent = ns.resolve(&path.parent()).unwrap().last().unwrap().1;
        ns.create(
            parent,
            path.last().unwrap(),
            StatMode::S_IFLNK,
            Some(target.to_string()),
        )
    }

    pub fn ino_of(&self, path: &str) -> Option<u64> {
        let ns = self.ns.lock().unwrap();
        ns.resolve(&FilePath::new(path))
            .ok()
            .map(|chain| chain.last().unwrap().1)
    }

    // -- fault injection and cap control --------------------------------

    pub fn set_down(&self, mds: usize, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(mds);
        } else {
            set.remove(&mds);
        }
    }

    /// A silent MDS accepts messages but never answers.
    pub fn set_silent(&self, mds: usize, silent: bool) {
        let mut set = self.silent.lock().unwrap();
        if silent {
            set.insert(mds);
        } else {
            set.remove(&mds);
        }
    }

    /// Re-issue caps when the client announces wanted bits it lacks.
    pub fn set_regrant(&self, on: bool) {
        *self.regrant.lock().unwrap() = on;
    }

    /// Sends a grant/revoke for `ino` with the next seq.
    pub fn revoke(&self, ino: u64, caps: CapMask) {
        let size = self.ns.lock().unwrap().nodes[&ino].attr.size;
        let seq = {
            let mut table = self.caps.lock().unwrap();
            table.issued.insert(ino, caps);
            table.next_seq(ino)
        };
        self.dispatch(Message::FileCaps(FileCaps {
            op: CapOp::Grant,
            ino,
            seq,
            caps,
            wanted: CapMask::empty(),
            size,
            mds: 0,
        }));
    }

    /// Sends a grant with an explicit seq, bypassing the seq counter.
    pub fn send_grant_raw(&self, ino: u64, caps: CapMask, seq: u64) {
        self.dispatch(Message::FileCaps(FileCaps {
            op: CapOp::Grant,
            ino,
            seq,
            caps,
            wanted: CapMask::empty(),
            size: 0,
            mds: 0,
        }));
    }

    // -- observation ----------------------------------------------------

    pub fn count_op(&self, op: MetaOp) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| r.op == op).count()
    }

    pub fn num_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn count_cap_op(&self, op: CapOp) -> usize {
        self.cap_msgs.lock().unwrap().iter().filter(|m| m.op == op).count()
    }

    pub fn acks(&self) -> Vec<FileCaps> {
        self.cap_msgs
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.op == CapOp::Ack)
            .cloned()
            .collect()
    }

    // -- the MDS itself -------------------------------------------------

    fn grant_for_open(&self, ino: u64, flags: OpenFlags) -> (CapMask, u64) {
        let mut mask = CapMask::empty();
        if flags.readable() {
            mask |= CapMask::RD | CapMask::RDCACHE;
        }
        if flags.writable() {
            mask |= CapMask::WR | CapMask::WRBUFFER;
        }
        let mut table = self.caps.lock().unwrap();
        let issued = table.issued.entry(ino).or_insert_with(CapMask::empty);
        *issued |= mask;
        let mask = *issued;
        let seq = table.next_seq(ino);
        (mask, seq)
    }

    fn handle_request(&self, mds: usize, req: MetaRequest) -> MetaReply {
        let tid = req.tid;
        let reply = |result, trace, data| MetaReply {
            tid,
            mds,
            result,
            trace,
            data,
        };
        let err = |e| reply(Err(e), Vec::new(), ReplyData::None);

        let mut ns = self.ns.lock().unwrap();
        let outcome: Result<(Vec<TraceStep>, ReplyData), Errno> = (|| {
            match req.op {
                MetaOp::Statfs => Ok((
                    Vec::new(),
                    ReplyData::Statfs(StatFs {
                        bsize: 4096,
                        blocks: 1 << 20,
                        bfree: 1 << 19,
                        bavail: 1 << 19,
                        files: 1 << 16,
                        ffree: 1 << 15,
                    }),
                )),
                MetaOp::Lstat => {
                    let chain = ns.resolve(&req.path)?;
                    Ok((ns.trace(&chain), ReplyData::None))
                }
                MetaOp::Getdir => {
                    let chain = ns.resolve(&req.path)?;
                    let ino = chain.last().unwrap().1;
                    if !ns.nodes[&ino].is_dir() {
                        return Err(Errno::ENOTDIR);
                    }
                    let entries = ns.nodes[&ino]
                        .children
                        .iter()
                        .map(|(name, &child)| (name.clone(), ns.info(child)))
                        .collect();
                    Ok((ns.trace(&chain), ReplyData::Dir(entries)))
                }
                MetaOp::Mkdir | MetaOp::Mknod | MetaOp::Symlink => {
                    let mut parent_path = req.path.clone();
                    let name = parent_path.pop().ok_or(Errno::EEXIST)?;
                    let chain = ns.resolve(&parent_path)?;
                    let parent = chain.last().unwrap().1;
                    if !ns.nodes[&parent].is_dir() {
                        return Err(Errno::ENOTDIR);
                    }
                    if ns.nodes[&parent].children.contains_key(&name) {
                        return Err(Errno::EEXIST);
                    }
                    let (mode, symlink) = match (&req.op, &req.arg) {
                        (MetaOp::Mkdir, _) => (StatMode::S_IFDIR | StatMode::S_IRWXU, None),
                        (MetaOp::Symlink, MetaArg::Target(t)) => {
                            (StatMode::S_IFLNK, Some(t.clone()))
                        }
                        _ => (StatMode::S_IFREG | StatMode::S_IRWXU, None),
                    };
                    let ino = ns.create(parent, &name, mode, symlink);
                    let mut chain = chain;
                    chain.push((name, ino));
                    Ok((ns.trace(&chain), ReplyData::None))
                }
                MetaOp::Open => {
                    let flags = match req.arg {
                        MetaArg::Flags(f) => f,
                        _ => return Err(Errno::EINVAL),
                    };
                    let chain = match ns.resolve(&req.path) {
                        Ok(chain) => {
                            if flags.contains(OpenFlags::O_CREAT | OpenFlags::O_EXCL) {
                                return Err(Errno::EEXIST);
                            }
                            chain
                        }
                        Err(Errno::ENOENT) if flags.contains(OpenFlags::O_CREAT) => {
                            let mut parent_path = req.path.clone();
                            let name = parent_path.pop().ok_or(Errno::ENOENT)?;
                            let pchain = ns.resolve(&parent_path)?;
                            let parent = pchain.last().unwrap().1;
                            let ino = ns.create(
                                parent,
                                &name,
                                StatMode::S_IFREG | StatMode::S_IRWXU,
                                None,
                            );
                            let mut chain = pchain;
                            chain.push((name, ino));
                            chain
                        }
                        Err(e) => return Err(e),
                    };
                    let ino = chain.last().unwrap().1;
                    let node = ns.nodes.get_mut(&ino).unwrap();
                    if node.is_dir() && flags.writable() {
                        return Err(Errno::EISDIR);
                    }
                    if flags.contains(OpenFlags::O_TRUNC) {
                        node.attr.size = 0;
                    }
                    let (caps, seq) = self.grant_for_open(ino, flags);
                    Ok((ns.trace(&chain), ReplyData::Open { caps, seq }))
                }
                MetaOp::Unlink | MetaOp::Rmdir => {
                    let chain = ns.resolve(&req.path)?;
                    let ino = chain.last().unwrap().1;
                    if chain.len() < 2 {
                        return Err(Errno::EINVAL);
                    }
                    let is_dir = ns.nodes[&ino].is_dir();
                    if req.op == MetaOp::Unlink && is_dir {
                        return Err(Errno::EISDIR);
                    }
                    if req.op == MetaOp::Rmdir {
                        if !is_dir {
                            return Err(Errno::ENOTDIR);
                        }
                        if !ns.nodes[&ino].children.is_empty() {
                            return Err(Errno::ENOTEMPTY);
                        }
                    }
                    let (name, parent) = {
                        let parent = chain[chain.len() - 2].1;
                        (chain.last().unwrap().0.clone(), parent)
                    };
                    ns.nodes.get_mut(&parent).unwrap().children.remove(&name);
                    let node = ns.nodes.get_mut(&ino).unwrap();
                    node.attr.nlink = node.attr.nlink.saturating_sub(1);
                    if is_dir || node.attr.nlink == 0 {
                        ns.nodes.remove(&ino);
                    }
                    Ok((ns.trace(&chain[..chain.len() - 1]), ReplyData::None))
                }
                MetaOp::Link => {
                    let newpath = match &req.arg {
                        MetaArg::Path(p) => p.clone(),
                        _ => return Err(Errno::EINVAL),
                    };
                    let src = ns.resolve(&req.path)?;
                    let ino = src.last().unwrap().1;
                    if ns.nodes[&ino].is_dir() {
                        return Err(Errno::EISDIR);
                    }
                    let mut parent_path = newpath.clone();
                    let name = parent_path.pop().ok_or(Errno::EEXIST)?;
                    let pchain = ns.resolve(&parent_path)?;
                    let parent = pchain.last().unwrap().1;
                    if ns.nodes[&parent].children.contains_key(&name) {
                        return Err(Errno::EEXIST);
                    }
                    ns.nodes
                        .get_mut(&parent)
                        .unwrap()
                        .children
                        .insert(name.clone(), ino);
                    ns.nodes.get_mut(&ino).unwrap().attr.nlink += 1;
                    let mut chain = pchain;
                    chain.push((name, ino));
                    Ok((ns.trace(&chain), ReplyData::None))
                }
                MetaOp::Rename => {
                    let to = match &req.arg {
                        MetaArg::Path(p) => p.clone(),
                        _ => return Err(Errno::EINVAL),
                    };
                    let src = ns.resolve(&req.path)?;
                    let ino = src.last().unwrap().1;
                    let src_name = src.last().unwrap().0.clone();
                    let src_parent = src[src.len() - 2].1;
                    let mut dst_parent_path = to.clone();
                    let dst_name = dst_parent_path.pop().ok_or(Errno::EINVAL)?;
                    let pchain = ns.resolve(&dst_parent_path)?;
                    let dst_parent = pchain.last().unwrap().1;
                    if let Some(&old) = ns.nodes[&dst_parent].children.get(&dst_name) {
                        if ns.nodes[&old].is_dir() {
                            return Err(Errno::EISDIR);
                        }
                        ns.nodes.remove(&old);
                    }
                    ns.nodes
                        .get_mut(&src_parent)
                        .unwrap()
                        .children
                        .remove(&src_name);
                    ns.nodes
                        .get_mut(&dst_parent)
                        .unwrap()
                        .children
                        .insert(dst_name.clone(), ino);
                    let mut chain = pchain;
                    chain.push((dst_name, ino));
                    Ok((ns.trace(&chain), ReplyData::None))
                }
                MetaOp::Chmod | MetaOp::Chown | MetaOp::Utime | MetaOp::Truncate => {
                    let chain = ns.resolve(&req.path)?;
                    let ino = chain.last().unwrap().1;
                    let node = ns.nodes.get_mut(&ino).unwrap();
                    match req.arg {
                        MetaArg::Mode(mode) => {
                            let fmt = node.attr.mode.bits() & StatMode::S_IFMT.bits();
                            node.attr.mode =
                                StatMode::from_bits_truncate(fmt | (mode & 0o7777));
                        }
                        MetaArg::Owner { uid, gid } => {
                            node.attr.uid = uid;
                            node.attr.gid = gid;
                        }
                        MetaArg::Times { atime, mtime } => {
                            node.attr.atime = atime;
                            node.attr.mtime = mtime;
                        }
                        MetaArg::Size(size) => node.attr.size = size,
                        _ => return Err(Errno::EINVAL),
                    }
                    Ok((ns.trace(&chain), ReplyData::None))
                }
            }
        })();
        match outcome {
            Ok((trace, data)) => reply(Ok(()), trace, data),
            Err(e) => err(e),
        }
    }

    fn handle_cap(&self, m: FileCaps) {
        if m.op != CapOp::Wanted || !*self.regrant.lock().unwrap() {
            return;
        }
        let regrant = {
            let mut table = self.caps.lock().unwrap();
            let issued = table.issued.entry(m.ino).or_insert_with(CapMask::empty);
            if issued.contains(m.wanted) {
                None
            } else {
                *issued |= m.wanted;
                let caps = *issued;
                let seq = table.next_seq(m.ino);
                Some((caps, seq))
            }
        };
        if let Some((caps, seq)) = regrant {
            self.dispatch(Message::FileCaps(FileCaps {
                op: CapOp::Grant,
                ino: m.ino,
                seq,
                caps,
                wanted: CapMask::empty(),
                size: 0,
                mds: 0,
            }));
        }
    }
}

impl Messenger for MockCluster {
    fn send(&self, mds: usize, msg: Message) -> Result<(), Errno> {
        if self.down.lock().unwrap().contains(&mds) {
            return Err(Errno::ENOTCONN);
        }
        // record before the silent check so tests can observe attempts
        match &msg {
            Message::Request(r) => self.requests.lock().unwrap().push(r.clone()),
            Message::FileCaps(c) => self.cap_msgs.lock().unwrap().push(c.clone()),
            _ => {}
        }
        if self.silent.lock().unwrap().contains(&mds) {
            trace!("mds{} is silent, swallowing message", mds);
            return Ok(());
        }
        match msg {
            Message::Request(req) => {
                let reply = self.handle_request(mds, req);
                self.dispatch(Message::Reply(reply));
            }
            Message::FileCaps(m) => self.handle_cap(m),
            _ => {}
        }
        Ok(())
    }
}

struct PendingWrite {
    ino: u64,
    offset: u64,
    data: Vec<u8>,
    done: WriteCallback,
}

/// In-memory object store. In manual mode writes park until
/// [`MockFiler::complete_all`], which is how tests hold buffers in flight.
pub struct MockFiler {
    objects: Mutex<BTreeMap<(u64, u64), Vec<u8>>>,
    manual: Mutex<bool>,
    pending: Mutex<Vec<PendingWrite>>,
    epochs: Mutex<Vec<u64>>,
}

impl MockFiler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(BTreeMap::new()),
            manual: Mutex::new(false),
            pending: Mutex::new(Vec::new()),
            epochs: Mutex::new(Vec::new()),
        })
    }

    pub fn set_manual(&self, on: bool) {
        *self.manual.lock().unwrap() = on;
    }

    /// Number of writes parked in manual mode.
    pub fn num_pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Lands every parked write and fires its completion.
    pub fn complete_all(&self) {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for io in pending {
            self.objects.lock().unwrap().insert((io.ino, io.offset), io.data);
            (io.done)(Ok(()));
        }
    }

    pub fn object(&self, ino: u64, offset: u64) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(&(ino, offset)).cloned()
    }

    /// Seeds object data directly, bypassing the client.
    pub fn put_object(&self, ino: u64, offset: u64, data: Vec<u8>) {
        self.objects.lock().unwrap().insert((ino, offset), data);
    }

    pub fn osd_epochs(&self) -> Vec<u64> {
        self.epochs.lock().unwrap().clone()
    }

    fn do_read(&self, ino: u64, offset: u64, len: usize) -> Vec<u8> {
        let objects = self.objects.lock().unwrap();
        if let Some((&(oino, boff), data)) = objects.range(..=(ino, offset)).next_back() {
            if oino == ino {
                let rel = (offset - boff) as usize;
                if rel + len <= data.len() {
                    return data[rel..rel + len].to_vec();
                }
            }
        }
        // sparse: unwritten ranges read as zeros
        vec![0; len]
    }
}

impl Filer for MockFiler {
    fn read(&self, ino: u64, offset: u64, len: usize, done: ReadCallback) {
        let bytes = self.do_read(ino, offset, len);
        done(Ok(bytes));
    }

    fn write(&self, ino: u64, offset: u64, data: Vec<u8>, done: WriteCallback) {
        if *self.manual.lock().unwrap() {
            self.pending.lock().unwrap().push(PendingWrite {
                ino,
                offset,
                data,
                done,
            });
            return;
        }
        self.objects.lock().unwrap().insert((ino, offset), data);
        done(Ok(()));
    }

    fn handle_osd_map(&self, map: OsdMap) {
        self.epochs.lock().unwrap().push(map.epoch);
    }
}
