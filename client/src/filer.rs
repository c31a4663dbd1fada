//! Object-I/O facade.

use errno::Errno;

pub type ReadCallback = Box<dyn FnOnce(Result<Vec<u8>, Errno>) + Send>;
pub type WriteCallback = Box<dyn FnOnce(Result<(), Errno>) + Send>;

/// Versioned cluster descriptor consumed by the object layer. The client
/// treats it as opaque and only forwards newer epochs.
#[derive(Debug, Clone)]
pub struct OsdMap {
    pub epoch: u64,
    pub data: Vec<u8>,
}

/// Non-blocking object I/O against the storage pool.
///
/// Completions run on an arbitrary thread and re-enter the client from
/// outside its lock.
pub trait Filer: Send + Sync {
    fn read(&self, ino: u64, offset: u64, len: usize, done: ReadCallback);
    fn write(&self, ino: u64, offset: u64, data: Vec<u8>, done: WriteCallback);
    fn handle_osd_map(&self, map: OsdMap);
}
