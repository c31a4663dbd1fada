//! Messages exchanged with the MDS cluster.
//!
//! The transport is not the client's business: a [`Messenger`] delivers
//! typed messages to a peer, and incoming messages are handed to
//! [`crate::Client::dispatch`]. Two conversations run over it: the blocking
//! request/reply metadata RPC, and the asynchronous capability protocol.

use errno::Errno;
use numeric_enum_macro::numeric_enum;

use crate::caps::CapMask;
use crate::flags::{OpenFlags, StatMode};
use crate::path::FilePath;

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum MetaOp {
        Statfs = 1,
        Lstat = 2,
        Getdir = 3,
        Mknod = 4,
        Mkdir = 5,
        Symlink = 6,
        Link = 7,
        Unlink = 8,
        Rename = 9,
        Rmdir = 10,
        Open = 11,
        Chmod = 12,
        Chown = 13,
        Utime = 14,
        Truncate = 15,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum CapOp {
        /// MDS to client: the new mask for this inode (grant or revoke).
        Grant = 1,
        /// Client to MDS: a revoke has been made safe, echoing its seq.
        Ack = 2,
        /// Client to MDS: voluntary drop of held bits.
        Release = 3,
        /// Client to MDS: the wanted mask changed.
        Wanted = 4,
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimeSpec {
    pub sec: u64,
    pub nsec: u32,
}

/// The cached POSIX metadata block of an inode, as the MDS reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct InodeAttr {
    pub ino: u64,
    pub mode: StatMode,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
    pub ctime: TimeSpec,
}

/// One inode as it appears in a reply trace.
#[derive(Debug, Clone)]
pub struct InodeInfo {
    pub attr: InodeAttr,
    pub symlink: Option<String>,
    /// Authority hint: the MDS owning this directory's metadata.
    pub dir_auth: Option<usize>,
    /// Replica MDS ids that may serve reads for this inode.
    pub replicas: Vec<usize>,
}

/// One step of a reply trace. The first step is the root and carries an
/// empty name.
#[derive(Debug, Clone)]
pub struct TraceStep {
    pub name: String,
    pub info: InodeInfo,
}

#[derive(Debug, Clone)]
pub enum MetaArg {
    None,
    Mode(u32),
    Flags(OpenFlags),
    Owner { uid: u32, gid: u32 },
    Times { atime: TimeSpec, mtime: TimeSpec },
    Size(u64),
    /// Second path: rename destination or link target path.
    Path(FilePath),
    /// Symlink target string.
    Target(String),
}

#[derive(Debug, Clone)]
pub struct MetaRequest {
    pub tid: u64,
    pub op: MetaOp,
    pub path: FilePath,
    pub arg: MetaArg,
}

#[derive(Debug, Clone, Default)]
pub struct StatFs {
    pub bsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
}

#[derive(Debug, Clone)]
pub enum ReplyData {
    None,
    Statfs(StatFs),
    /// Directory listing: the children of the trace's terminal inode.
    Dir(Vec<(String, InodeInfo)>),
    /// Initial capability grant for an open.
    Open { caps: CapMask, seq: u64 },
}

#[derive(Debug, Clone)]
pub struct MetaReply {
    pub tid: u64,
    /// The MDS that served the request; an open handle stays bound to it.
    pub mds: usize,
    pub result: Result<(), Errno>,
    /// Inode/name records from the root down to the subject. Empty on error.
    pub trace: Vec<TraceStep>,
    pub data: ReplyData,
}

/// Capability message. `Grant` flows MDS to client; the other ops flow back.
/// `seq` orders the conversation per `(ino, mds)`: a message that does not
/// advance it is stale and dropped.
#[derive(Debug, Clone)]
pub struct FileCaps {
    pub op: CapOp,
    pub ino: u64,
    pub seq: u64,
    pub caps: CapMask,
    pub wanted: CapMask,
    pub size: u64,
    /// The MDS this cap conversation is with.
    pub mds: usize,
}

#[derive(Debug, Clone)]
pub enum Message {
    Request(MetaRequest),
    Reply(MetaReply),
    FileCaps(FileCaps),
    OsdMap(crate::filer::OsdMap),
}

/// Asynchronous message-passing endpoint.
///
/// `send` hands the message to the transport; delivery is not acknowledged.
/// `Err(ENOTCONN)` means the peer is unreachable right now, which the
/// request pipeline treats as "try the next candidate".
///
/// The client never calls `send` while holding its lock, so an
/// implementation may deliver replies synchronously from inside `send`.
pub trait Messenger: Send + Sync {
    fn send(&self, mds: usize, msg: Message) -> Result<(), Errno>;
}
