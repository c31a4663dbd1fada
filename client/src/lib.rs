//! Client side of the shoal distributed filesystem.
//!
//! The client translates POSIX-like calls into metadata requests against an
//! MDS cluster, caches the directory/inode graph it learns from reply
//! traces, tracks the per-MDS capabilities issued on each cached inode, and
//! coordinates dirty-buffer writeback with the capability lifecycle. File
//! data lives in an object pool reached through the non-blocking [`Filer`]
//! facade; metadata authority stays with the MDS cluster.
//!
//! All shared state sits behind one client lock. Long operations (MDS
//! round-trips, object I/O) drop the lock and park on a condition that is
//! re-checked after wakeup, so message dispatch and I/O completions always
//! enter the lock fresh.

mod buffer;
mod cache;
mod caps;
mod client;
mod config;
mod filer;
mod flags;
mod handle;
mod logger;
mod message;
mod path;
mod request;
pub mod testing;

#[cfg(test)]
mod tests;

pub use buffer::BufState;
pub use cache::{MetaCache, Resolved};
pub use caps::{CapMask, InodeCap};
pub use client::Client;
pub use config::*;
pub use filer::{Filer, OsdMap, ReadCallback, WriteCallback};
pub use flags::{OpenFlags, StatMode};
pub use handle::Fh;
pub use logger::init_logger;
pub use message::{
    CapOp, FileCaps, InodeAttr, InodeInfo, Message, Messenger, MetaArg, MetaOp, MetaReply,
    MetaRequest, ReplyData, StatFs, TimeSpec, TraceStep,
};
pub use path::FilePath;
