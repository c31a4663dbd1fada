//! Facade operation tests against the mock cluster.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use errno::Errno;

use super::setup;
use crate::filer::OsdMap;
use crate::flags::OpenFlags;
use crate::message::{Message, MetaOp, TimeSpec};

#[test]
fn test_getdir_splices_children() {
    let (client, cluster, _filer) = setup();
    cluster.add_dir("/d");
    cluster.add_file("/d/a", 1);
    cluster.add_file("/d/b", 2);
    cluster.add_file("/d/c", 3);
    client.mount().unwrap();

    let entries = client.getdir("/d").unwrap();
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["a", "b", "c"]);

    // the listing primed the cache; stats of children are free now
    let base = cluster.count_op(MetaOp::Lstat);
    assert_eq!(client.lstat("/d/b").unwrap().size, 2);
    assert_eq!(cluster.count_op(MetaOp::Lstat), base);
    client.verify_cache();
}

#[test]
fn test_getdir_empty_dir() {
    let (client, cluster, _filer) = setup();
    let e_ino = cluster.add_dir("/e");
    client.mount().unwrap();
    assert!(client.getdir("/e").unwrap().is_empty());
    // an empty listing must not leave an empty child table resident
    let inner = client.lock();
    assert!(inner.cache.inode(e_ino).unwrap().dir.is_none());
    drop(inner);
    client.verify_cache();

    assert_eq!(client.getdir("/missing"), Err(Errno::ENOENT));
    cluster.add_file("/f", 0);
    assert_eq!(client.getdir("/f"), Err(Errno::ENOTDIR));
}

#[test]
fn test_unlink_and_rmdir() {
    let (client, cluster, _filer) = setup();
    cluster.add_dir("/d");
    cluster.add_file("/d/f", 0);
    client.mount().unwrap();
    client.lstat("/d/f").unwrap();

    client.unlink("/d/f").unwrap();
    client.verify_cache();
    assert_eq!(client.lstat("/d/f"), Err(Errno::ENOENT));
    assert_eq!(client.unlink("/d/f"), Err(Errno::ENOENT));

    client.rmdir("/d").unwrap();
    client.verify_cache();
    assert_eq!(client.lstat("/d"), Err(Errno::ENOENT));

    cluster.add_file("/g", 0);
    assert_eq!(client.rmdir("/g"), Err(Errno::ENOTDIR));
    cluster.add_dir("/h");
    cluster.add_file("/h/x", 0);
    assert_eq!(client.rmdir("/h"), Err(Errno::ENOTEMPTY));
    assert_eq!(client.unlink("/h"), Err(Errno::EISDIR));
}

#[test]
fn test_symlink_readlink() {
    let (client, cluster, _filer) = setup();
    client.mount().unwrap();
    client.symlink("/some/where", "/l").unwrap();
    assert_eq!(client.readlink("/l").unwrap(), "/some/where");
    let attr = client.lstat("/l").unwrap();
    assert!(attr.mode.is_lnk());

    cluster.add_file("/f", 0);
    assert_eq!(client.readlink("/f"), Err(Errno::EINVAL));
    client.verify_cache();
}

#[test]
fn test_statfs() {
    let (client, _cluster, _filer) = setup();
    client.mount().unwrap();
    let st = client.statfs().unwrap();
    assert_eq!(st.bsize, 4096);
    assert!(st.blocks > 0);
}

#[test]
fn test_attr_updates() {
    let (client, cluster, _filer) = setup();
    cluster.add_file("/f", 100);
    client.mount().unwrap();

    client.chmod("/f", 0o600).unwrap();
    assert_eq!(client.lstat("/f").unwrap().mode.bits() & 0o777, 0o600);

    client.chown("/f", 7, 8).unwrap();
    let attr = client.lstat("/f").unwrap();
    assert_eq!((attr.uid, attr.gid), (7, 8));

    client
        .utime(
            "/f",
            TimeSpec { sec: 9, nsec: 0 },
            TimeSpec { sec: 11, nsec: 0 },
        )
        .unwrap();
    let attr = client.lstat("/f").unwrap();
    assert_eq!(attr.atime.sec, 9);
    assert_eq!(attr.mtime.sec, 11);

    client.truncate("/f", 10).unwrap();
    assert_eq!(client.lstat("/f").unwrap().size, 10);
    client.verify_cache();
}

#[test]
fn test_mkdir_mknod_collisions() {
    let (client, _cluster, _filer) = setup();
    client.mount().unwrap();
    client.mkdir("/d", 0o755).unwrap();
    assert_eq!(client.mkdir("/d", 0o755), Err(Errno::EEXIST));
    client.mknod("/d/f", 0o644).unwrap();
    assert_eq!(client.mknod("/d/f", 0o644), Err(Errno::EEXIST));
    assert_eq!(client.mkdir("/missing/d", 0o755), Err(Errno::ENOENT));
    assert!(client.lstat("/d/f").unwrap().mode.is_reg());
    client.verify_cache();
}

#[test]
fn test_hard_link() {
    let (client, cluster, _filer) = setup();
    let f_ino = cluster.add_file("/f", 0);
    client.mount().unwrap();
    client.link("/f", "/g").unwrap();
    let g = client.lstat("/g").unwrap();
    assert_eq!(g.ino, f_ino);
    assert_eq!(g.nlink, 2);
    assert_eq!(client.lstat("/f").unwrap().ino, f_ino);
    client.verify_cache();
}

#[test]
fn test_osd_map_forwarding() {
    let (client, _cluster, filer) = setup();
    client.dispatch(Message::OsdMap(OsdMap {
        epoch: 2,
        data: Vec::new(),
    }));
    client.dispatch(Message::OsdMap(OsdMap {
        epoch: 1,
        data: Vec::new(),
    }));
    client.dispatch(Message::OsdMap(OsdMap {
        epoch: 3,
        data: Vec::new(),
    }));
    // stale epochs are dropped, newer ones forwarded in order
    assert_eq!(filer.osd_epochs(), [2, 3]);
}

#[test]
fn test_background_flush_policy() {
    let (client, cluster, filer) = setup();
    client.mount().unwrap();
    let fh = client
        .open("/f", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    let ino = cluster.ino_of("/f").unwrap();
    client.write(fh, 0, b"aged").unwrap();
    client.write(fh, 4096, b"young").unwrap();

    // nothing is old enough and the dirty total is under the ceiling
    client.flush_buffers(Duration::from_secs(3600), 1 << 20);
    assert!(filer.object(ino, 0).is_none());

    // size pressure flushes everything, offset-ascending
    client.flush_buffers(Duration::from_secs(3600), 0);
    assert_eq!(filer.object(ino, 0).unwrap(), b"aged");
    assert_eq!(filer.object(ino, 4096).unwrap(), b"young");

    // a zero ttl catches any remaining dirty buffer
    client.write(fh, 8192, b"late").unwrap();
    client.flush_buffers(Duration::ZERO, 1 << 20);
    assert_eq!(filer.object(ino, 8192).unwrap(), b"late");

    client.close(fh).unwrap();
    client.unmount().unwrap();
}

#[test]
fn test_fsync_waits_for_writeback() {
    let (client, cluster, filer) = setup();
    client.mount().unwrap();
    filer.set_manual(true);
    let fh = client
        .open("/f", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    let ino = cluster.ino_of("/f").unwrap();
    client.write(fh, 0, b"sync me").unwrap();

    let completer = {
        let filer = Arc::clone(&filer);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            filer.complete_all();
        })
    };
    client.fsync(fh).unwrap();
    completer.join().unwrap();
    assert_eq!(filer.object(ino, 0).unwrap(), b"sync me");

    filer.set_manual(false);
    client.close(fh).unwrap();
    client.unmount().unwrap();
}

#[test]
fn test_write_readback_through_cache() {
    let (client, cluster, _filer) = setup();
    client.mount().unwrap();
    let fh = client
        .open("/f", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    client.write(fh, 0, b"0123456789").unwrap();
    // served straight from the dirty buffer
    assert_eq!(client.read(fh, 2, 4).unwrap(), b"2345");
    assert_eq!(client.lstat("/f").unwrap().size, 10);
    // reads past eof clamp
    assert_eq!(client.read(fh, 8, 10).unwrap(), b"89");
    assert!(client.read(fh, 20, 4).unwrap().is_empty());
    let _ = cluster;
    client.close(fh).unwrap();
    client.unmount().unwrap();
}
