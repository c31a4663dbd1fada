//! End-to-end scenarios against the mock cluster.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use errno::Errno;

use super::setup;
use crate::caps::CapMask;
use crate::flags::OpenFlags;
use crate::message::{CapOp, MetaOp};

#[test]
fn test_resolve_miss_then_hit() {
    let (client, cluster, _filer) = setup();
    cluster.add_dir("/a");
    cluster.add_file("/a/b", 0);
    client.mount().unwrap();
    let base = cluster.count_op(MetaOp::Lstat);
    let attr = client.lstat("/a/b").unwrap();
    assert!(attr.mode.is_reg());
    assert_eq!(cluster.count_op(MetaOp::Lstat), base + 1);
    // the whole three-inode trace is resident now
    client.lstat("/a/b").unwrap();
    client.lstat("/a").unwrap();
    assert_eq!(cluster.count_op(MetaOp::Lstat), base + 1);
    client.verify_cache();
}

#[test]
fn test_rename_across_dirs() {
    let (client, cluster, _filer) = setup();
    cluster.add_dir("/x");
    cluster.add_dir("/y");
    let f_ino = cluster.add_file("/x/f", 0);
    client.mount().unwrap();
    client.lstat("/x/f").unwrap();
    client.lstat("/y").unwrap();
    let x_ino = cluster.ino_of("/x").unwrap();
    let y_ino = cluster.ino_of("/y").unwrap();
    let f_refs = client.lock().cache.inode(f_ino).unwrap().refs;

    client.rename("/x/f", "/y/f").unwrap();

    {
        let inner = client.lock();
        assert!(inner.cache.lookup(y_ino, "f").is_some());
        assert!(inner.cache.lookup(x_ino, "f").is_none());
        assert_eq!(inner.cache.inode(f_ino).unwrap().refs, f_refs);
        // x emptied out, so its child table went away
        assert!(inner.cache.inode(x_ino).unwrap().dir.is_none());
    }
    client.verify_cache();
    // and the rename is visible without another round-trip
    let base = cluster.num_requests();
    assert_eq!(client.lstat("/y/f").unwrap().ino, f_ino);
    assert_eq!(cluster.num_requests(), base);
}

#[test]
fn test_write_then_downgrade_defers_ack() {
    let (client, cluster, filer) = setup();
    client.mount().unwrap();
    filer.set_manual(true);
    let fh = client
        .open("/f", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    let f_ino = cluster.ino_of("/f").unwrap();
    let data = vec![0xab; 4096];
    assert_eq!(client.write(fh, 0, &data).unwrap(), 4096);

    // the MDS strips WRBUFFER while the 4096 bytes are still dirty
    cluster.revoke(
        f_ino,
        CapMask::RD | CapMask::RDCACHE | CapMask::WR,
    );
    assert!(cluster.acks().is_empty());
    assert_eq!(filer.num_pending(), 1);
    {
        let inner = client.lock();
        // the revoke is parked; the old grant still stands
        let inode = inner.cache.inode(f_ino).unwrap();
        assert!(inode.mds_caps(0).contains(CapMask::WRBUFFER));
        assert_eq!(inner.cap_reap.len(), 1);
    }

    // once the bytes land, the downgrade applies and the ack goes out
    filer.complete_all();
    let acks = cluster.acks();
    assert_eq!(acks.len(), 1);
    assert!(!acks[0].caps.contains(CapMask::WRBUFFER));
    assert_eq!(filer.object(f_ino, 0).unwrap(), data);
    {
        let inner = client.lock();
        let inode = inner.cache.inode(f_ino).unwrap();
        assert!(!inode.mds_caps(0).contains(CapMask::WRBUFFER));
        assert!(inner.cap_reap.is_empty());
    }

    // a subsequent read sees the written data
    assert_eq!(client.read(fh, 0, 4096).unwrap(), data);
    client.verify_cache();
    filer.set_manual(false);
    client.close(fh).unwrap();
    client.unmount().unwrap();
}

#[test]
fn test_eviction_respects_pin() {
    let (client, cluster, _filer) = setup();
    cluster.add_dir("/a");
    cluster.add_dir("/a/b");
    cluster.add_dir("/a/b/c");
    cluster.add_dir("/a/b/c/d");
    cluster.add_dir("/a/b/c/d/e");
    cluster.add_file("/a/b/c/d/e/f", 0);
    client.mount().unwrap();
    client.lstat("/a/b/c/d/e/f").unwrap();

    client.set_cache_size(3);
    client.trim_cache();

    {
        let inner = client.lock();
        assert_eq!(inner.cache.lru.size(), 3);
        let root = inner.cache.root().unwrap();
        // eviction ran bottom-up and stopped well before the open dir /a
        assert!(inner.cache.lookup(root, "a").is_some());
        let b = cluster.ino_of("/a/b").unwrap();
        let c = cluster.ino_of("/a/b/c").unwrap();
        assert!(inner.cache.lookup(b, "c").is_some());
        assert!(inner.cache.lookup(c, "d").is_none());
    }
    client.verify_cache();
}

#[test]
fn test_stale_handle_across_cap_loss() {
    let (client, cluster, filer) = setup();
    let f_ino = cluster.add_file("/f", 3);
    filer.put_object(f_ino, 0, b"abc".to_vec());
    client.mount().unwrap();
    let fh = client.open("/f", OpenFlags::O_RDONLY).unwrap();
    assert_eq!(client.read(fh, 0, 3).unwrap(), b"abc");

    // the MDS revokes everything and then goes silent
    cluster.revoke(f_ino, CapMask::empty());
    cluster.set_silent(0, true);
    let wanted_before = cluster.count_cap_op(CapOp::Wanted);
    assert_eq!(client.read(fh, 0, 3), Err(Errno::ESTALE));
    // the failed read asked for a re-issue
    assert!(cluster.count_cap_op(CapOp::Wanted) > wanted_before);
    {
        let inner = client.lock();
        let inode = inner.cache.inode(f_ino).unwrap();
        assert!(inode.caps.is_empty());
        assert!(inode.stale_caps.contains_key(&0));
    }

    // the MDS returns; its re-issue supersedes the stale record by seq
    cluster.set_silent(0, false);
    cluster.set_regrant(true);
    assert_eq!(client.read(fh, 0, 3).unwrap(), b"abc");
    {
        let inner = client.lock();
        let inode = inner.cache.inode(f_ino).unwrap();
        assert!(inode.mds_caps(0).contains(CapMask::RD));
        assert!(inode.stale_caps.is_empty());
    }
    client.verify_cache();
    client.close(fh).unwrap();
}

#[test]
fn test_unmount_quiescence() {
    let (client, cluster, filer) = setup();
    client.mount().unwrap();
    let fh1 = client
        .open("/f1", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    let fh2 = client
        .open("/f2", OpenFlags::O_CREAT | OpenFlags::O_RDWR)
        .unwrap();
    let ino1 = cluster.ino_of("/f1").unwrap();
    let ino2 = cluster.ino_of("/f2").unwrap();
    client.write(fh1, 0, b"hello").unwrap();
    client.write(fh2, 0, b"world").unwrap();

    let closer = {
        let client = Arc::clone(&client);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            client.close(fh1).unwrap();
            thread::sleep(Duration::from_millis(20));
            client.close(fh2).unwrap();
        })
    };
    // blocks until both handles are closed and all buffers drained
    client.unmount().unwrap();
    closer.join().unwrap();

    assert_eq!(filer.object(ino1, 0).unwrap(), b"hello");
    assert_eq!(filer.object(ino2, 0).unwrap(), b"world");
    {
        let inner = client.lock();
        assert!(inner.cache.root().is_none());
        assert!(inner.cache.is_empty());
        assert!(inner.fhs.is_empty());
    }
    assert_eq!(client.unmount(), Err(Errno::ENOTCONN));
    // a fresh mount works again
    client.mount().unwrap();
    client.unmount().unwrap();
}

#[test]
fn test_cap_seq_regression_is_noop() {
    let (client, cluster, _filer) = setup();
    let f_ino = cluster.add_file("/f", 0);
    client.mount().unwrap();
    let fh = client.open("/f", OpenFlags::O_RDONLY).unwrap();
    let held = client.lock().cache.inode(f_ino).unwrap().mds_caps(0);
    assert!(held.contains(CapMask::RD | CapMask::RDCACHE));

    // a message that does not advance the seq is dropped
    cluster.send_grant_raw(f_ino, CapMask::RD, 1);
    cluster.send_grant_raw(f_ino, CapMask::empty(), 0);
    {
        let inner = client.lock();
        let inode = inner.cache.inode(f_ino).unwrap();
        assert_eq!(inode.mds_caps(0), held);
        assert!(inode.stale_caps.is_empty());
    }
    client.verify_cache();
    client.close(fh).unwrap();
}

#[test]
fn test_open_close_round_trip() {
    let (client, cluster, _filer) = setup();
    let f_ino = cluster.add_file("/f", 0);
    client.mount().unwrap();
    client.lstat("/f").unwrap();
    let refs = client.lock().cache.inode(f_ino).unwrap().refs;

    let fh = client.open("/f", OpenFlags::O_RDONLY).unwrap();
    assert_eq!(fh, 0);
    {
        let inner = client.lock();
        let inode = inner.cache.inode(f_ino).unwrap();
        assert_eq!(inode.refs, refs + 1);
        assert_eq!(inode.num_readers, 1);
    }
    client.verify_cache();
    client.close(fh).unwrap();
    {
        let inner = client.lock();
        let inode = inner.cache.inode(f_ino).unwrap();
        assert_eq!(inode.refs, refs);
        assert_eq!(inode.num_readers, 0);
    }
    // the freed id is handed out again
    let fh = client.open("/f", OpenFlags::O_RDONLY).unwrap();
    assert_eq!(fh, 0);
    client.close(fh).unwrap();
    client.verify_cache();
}

#[test]
fn test_transport_retry_exhaustion() {
    let (client, cluster, _filer) = setup();
    cluster.set_down(0, true);
    assert_eq!(client.mount(), Err(Errno::ENOTCONN));
    cluster.set_down(0, false);
    client.mount().unwrap();
    client.verify_cache();
}
