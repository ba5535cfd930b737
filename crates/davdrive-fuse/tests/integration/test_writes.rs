//! Content transfer: reads, buffered writes, streamed writes and flushing

use std::sync::Arc;

use davdrive_core::{config::FlushMode, ports::RemoteError};
use davdrive_fuse::{CleanupFlags, DriveError, DriveEvent, FileSystemCallbacks, WriteState};

use crate::common::{Harness, MockRepository};

fn modified() -> CleanupFlags {
    CleanupFlags {
        set_last_write_time: true,
        ..CleanupFlags::default()
    }
}

fn server_error(status: u16) -> RemoteError {
    RemoteError::Http {
        status,
        message: "server error".to_string(),
    }
}

#[test]
fn test_create_write_close_uploads_once() {
    let h = Harness::new();
    let data = vec![7u8; 100];

    let created = h.driver.create("\\new.txt", false, 0).unwrap();
    assert_eq!(created.info.file_size, 0);
    let outcome = h.write(&created.node, 0, &data).unwrap();
    assert_eq!(outcome.bytes_written, 100);
    assert_eq!(outcome.info.file_size, 100);

    h.driver.cleanup(&created.node, modified());
    h.driver.close(&created.node);

    let uploads = h.remote.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, "/dav/new.txt");
    assert_eq!(uploads[0].1, data);
    assert_eq!(created.node.write_state(), WriteState::Clean);
    assert_eq!(created.node.open_count(), 0);

    // A fresh mount sees the uploaded size
    let fresh = Harness::with_remote(h.remote.clone(), |b| b);
    let reopened = fresh.driver.open("\\new.txt").unwrap();
    assert_eq!(reopened.info.file_size, 100);
}

#[test]
fn test_deferred_write_is_visible_to_reads() {
    let remote = Arc::new(MockRepository::new());
    remote.add_file("doc.txt", b"hello world");
    let h = Harness::with_remote(remote, |b| b);

    let opened = h.driver.open("\\doc.txt").unwrap();
    assert!(!opened.node.has_buffer());

    // The content is not loaded yet, so the write waits for a download
    let outcome = h.write(&opened.node, 0, b"HELLO").unwrap();
    assert_eq!(outcome.bytes_written, 5);
    assert_eq!(h.remote.calls("download"), 1);

    let content = h.read(&opened.node, 0, 64).unwrap();
    assert_eq!(content, b"HELLO world".to_vec());
    assert_eq!(h.remote.calls("download_partial"), 0);
    assert!(opened.node.has_unflushed_data());

    h.driver.cleanup(&opened.node, modified());
    h.driver.close(&opened.node);
    assert_eq!(h.remote.content("doc.txt"), Some(b"HELLO world".to_vec()));
}

#[test]
fn test_ranged_reads() {
    let remote = Arc::new(MockRepository::new());
    let content: Vec<u8> = (0..100u8).collect();
    remote.add_file("big.bin", &content);
    let h = Harness::with_remote(remote, |b| b);
    let node = h.driver.open("\\big.bin").unwrap().node;

    let middle = h.read(&node, 10, 20).unwrap();
    assert_eq!(middle, content[10..30].to_vec());
    assert!(!node.has_buffer());

    let tail = h.read(&node, 90, 50).unwrap();
    assert_eq!(tail, content[90..].to_vec());

    assert!(matches!(h.read(&node, 100, 10), Err(DriveError::EndOfFile)));
    assert_eq!(h.remote.calls("download_partial"), 2);

    // A whole-file read keeps the content for later reads
    let whole = h.read(&node, 0, 4096).unwrap();
    assert_eq!(whole, content);
    assert!(node.has_buffer());
    let cached = h.read(&node, 50, 10).unwrap();
    assert_eq!(cached, content[50..60].to_vec());
    assert_eq!(h.remote.calls("download_partial"), 3);
}

#[test]
fn test_read_of_missing_remote_file_invalidates() {
    let remote = Arc::new(MockRepository::new());
    remote.add_file("gone.txt", b"soon gone");
    let h = Harness::with_remote(remote, |b| b);
    let node = h.driver.open("\\gone.txt").unwrap().node;

    h.remote.fail("download_partial", RemoteError::NotFound("/dav/gone.txt".to_string()));
    assert!(matches!(h.read(&node, 0, 4), Err(DriveError::NotFound(_))));
    assert!(h.driver.cache().lookup("\\gone.txt").node().is_none());
}

#[test]
fn test_failed_flush_keeps_recovery_copy() {
    let mut h = Harness::new();
    let created = h.driver.create("\\report.txt", false, 0).unwrap();
    h.write(&created.node, 0, b"precious").unwrap();

    h.remote.fail("upload", server_error(507));
    h.driver.cleanup(&created.node, modified());
    assert_eq!(created.node.write_state(), WriteState::FailedWithBackup);

    let events = h.drain_events();
    let copy = events
        .iter()
        .find_map(|event| match event {
            DriveEvent::Action(action) if action.method == "Cleanup" && !action.is_success() => {
                action.local_temporary_path.clone()
            }
            _ => None,
        })
        .expect("failed cleanup with a recovery copy");
    assert!(copy.starts_with(h.recovery.path()));
    assert_eq!(std::fs::read(&copy).unwrap(), b"precious".to_vec());

    // The failed node left the cache
    assert!(h.driver.cache().lookup("\\report.txt").node().is_none());

    h.driver.close(&created.node);
    assert_eq!(created.node.open_count(), 0);
    assert!(created.node.has_unflushed_data());
    assert!(h.remote.uploads().is_empty());

    // Closing the handle does not repeat the failed save
    assert_eq!(h.remote.calls("upload"), 1);
    assert_eq!(std::fs::read_dir(h.recovery.path()).unwrap().count(), 1);
    assert!(!h.drain_events().iter().any(|event| matches!(
        event,
        DriveEvent::Action(action) if !action.is_success()
    )));
}

#[test]
fn test_flush_retries_until_success() {
    let h = Harness::with(|b| b.flush_retries(2, 0));
    let created = h.driver.create("\\retry.txt", false, 0).unwrap();
    h.write(&created.node, 0, b"retry me").unwrap();

    h.remote.fail_times("upload", server_error(503), 1);
    h.driver.cleanup(&created.node, modified());

    assert_eq!(h.remote.calls("upload"), 2);
    assert_eq!(h.remote.content("retry.txt"), Some(b"retry me".to_vec()));
    assert_eq!(created.node.write_state(), WriteState::Clean);
    h.driver.close(&created.node);
}

#[test]
fn test_unauthorized_flush_is_not_retried() {
    let mut h = Harness::with(|b| b.flush_retries(3, 0));
    let created = h.driver.create("\\secret.txt", false, 0).unwrap();
    h.write(&created.node, 0, b"data").unwrap();

    h.remote.fail("upload", RemoteError::Unauthorized);
    h.driver.cleanup(&created.node, modified());

    assert_eq!(h.remote.calls("upload"), 1);
    assert!(h.drain_events().contains(&DriveEvent::AuthenticationFailed));
    assert!(h.driver.cache().is_empty());
}

#[test]
fn test_open_count_balances() {
    let remote = Arc::new(MockRepository::new());
    remote.add_file("shared.txt", b"shared");
    let h = Harness::with_remote(remote, |b| b);

    let handles: Vec<_> = (0..3)
        .map(|_| h.driver.open("\\shared.txt").unwrap())
        .collect();
    assert!(handles.iter().all(|other| Arc::ptr_eq(&other.node, &handles[0].node)));
    assert_eq!(handles[0].node.open_count(), 3);

    h.read(&handles[0].node, 0, 4096).unwrap();
    assert!(handles[0].node.has_buffer());

    for handle in &handles {
        h.driver.cleanup(&handle.node, CleanupFlags::default());
        h.driver.close(&handle.node);
    }
    assert_eq!(handles[0].node.open_count(), 0);
    assert!(!handles[0].node.has_buffer());
    assert_eq!(h.remote.calls("upload"), 0);
}

#[test]
fn test_concurrent_open_and_close_balance() {
    let remote = Arc::new(MockRepository::new());
    remote.add_file("busy.txt", b"busy");
    let h = Harness::with_remote(remote, |b| b);
    let first = h.driver.open("\\busy.txt").unwrap().node;
    h.read(&first, 0, 4096).unwrap();

    let driver = &h.driver;
    let nodes: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| scope.spawn(move || driver.open("\\busy.txt").unwrap().node))
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect()
    });
    assert!(nodes.iter().all(|node| Arc::ptr_eq(node, &first)));
    assert_eq!(first.open_count(), 9);

    std::thread::scope(|scope| {
        for node in &nodes {
            scope.spawn(move || {
                driver.cleanup(node, CleanupFlags::default());
                driver.close(node);
            });
        }
    });
    assert_eq!(first.open_count(), 1);
    assert!(first.has_buffer());

    h.driver.cleanup(&first, CleanupFlags::default());
    h.driver.close(&first);
    assert_eq!(first.open_count(), 0);
    assert!(!first.has_buffer());
    assert_eq!(h.remote.calls("upload"), 0);
}

#[test]
fn test_overwrite_truncates() {
    let remote = Arc::new(MockRepository::new());
    remote.add_file("log.txt", b"old contents");
    let h = Harness::with_remote(remote, |b| b);
    let node = h.driver.open("\\log.txt").unwrap().node;

    let info = h.driver.overwrite(&node, 0).unwrap();
    assert_eq!(info.file_size, 0);
    h.write(&node, 0, b"new").unwrap();

    h.driver.cleanup(&node, modified());
    h.driver.close(&node);
    assert_eq!(h.remote.content("log.txt"), Some(b"new".to_vec()));
    assert_eq!(h.remote.calls("download"), 0);
}

#[test]
fn test_set_file_size_extends_with_zeros() {
    let remote = Arc::new(MockRepository::new());
    remote.add_file("z.bin", b"ab");
    let h = Harness::with_remote(remote, |b| b);
    let node = h.driver.open("\\z.bin").unwrap().node;

    let info = h.driver.set_file_size(&node, 5, false).unwrap();
    assert_eq!(info.file_size, 5);
    assert!(node.has_unflushed_data());

    h.driver.cleanup(&node, modified());
    h.driver.close(&node);
    assert_eq!(h.remote.content("z.bin"), Some(b"ab\0\0\0".to_vec()));
}

#[test]
fn test_truncate_to_zero_skips_download() {
    let remote = Arc::new(MockRepository::new());
    remote.add_file("huge.bin", &[9u8; 64 * 1024]);
    let h = Harness::with_remote(remote, |b| b);
    let node = h.driver.open("\\huge.bin").unwrap().node;

    let info = h.driver.set_file_size(&node, 0, false).unwrap();
    assert_eq!(info.file_size, 0);
    assert_eq!(h.remote.calls("download"), 0);
    assert!(h.read(&node, 0, 16).is_err());

    h.driver.cleanup(&node, modified());
    h.driver.close(&node);
    assert_eq!(h.remote.content("huge.bin"), Some(Vec::new()));
    assert_eq!(h.remote.calls("download"), 0);
}

#[test]
fn test_small_write_under_a_small_limit() {
    let h = Harness::with(|b| b.max_file_size(1000));
    let created = h.driver.create("\\tiny.txt", false, 0).unwrap();

    let outcome = h.write(&created.node, 0, b"0123456789").unwrap();
    assert_eq!(outcome.info.file_size, 10);
    assert!(outcome.info.allocation_size <= 1000);

    h.driver.cleanup(&created.node, modified());
    h.driver.close(&created.node);
    assert_eq!(h.remote.content("tiny.txt"), Some(b"0123456789".to_vec()));
}

#[test]
fn test_oversized_write_is_disk_full() {
    let h = Harness::with(|b| b.max_file_size(8));
    let created = h.driver.create("\\small.bin", false, 0).unwrap();

    assert!(matches!(
        h.write(&created.node, 0, &[1u8; 16]),
        Err(DriveError::DiskFull(_))
    ));
    assert!(matches!(
        h.driver.create("\\big.bin", false, 64),
        Err(DriveError::DiskFull(_))
    ));
}

#[test]
fn test_streamed_writes_form_one_upload() {
    let h = Harness::with(|b| b.flush_mode(FlushMode::AtWrite));
    let created = h.driver.create("\\stream.txt", false, 0).unwrap();

    h.write(&created.node, 0, b"abc").unwrap();
    let outcome = h.write(&created.node, 3, b"def").unwrap();
    assert_eq!(outcome.info.file_size, 6);
    assert!(created.node.has_unflushed_data());

    h.driver.cleanup(&created.node, modified());
    h.driver.close(&created.node);

    assert_eq!(
        h.remote.uploads(),
        vec![("/dav/stream.txt".to_string(), b"abcdef".to_vec())]
    );
    assert!(!created.node.has_unflushed_data());
}

#[test]
fn test_streamed_write_out_of_order_restarts_at_offset() {
    let h = Harness::with(|b| b.flush_mode(FlushMode::AtWrite));
    let created = h.driver.create("\\sparse.bin", false, 0).unwrap();

    h.write(&created.node, 0, b"abc").unwrap();
    h.write(&created.node, 10, b"xyz").unwrap();
    h.driver.cleanup(&created.node, modified());
    h.driver.close(&created.node);

    assert_eq!(h.remote.calls("upload"), 1);
    assert_eq!(h.remote.calls("upload_partial"), 1);
    assert_eq!(
        h.remote.content("sparse.bin"),
        Some(b"abc\0\0\0\0\0\0\0xyz".to_vec())
    );
}

#[test]
fn test_volume_info_and_label() {
    let h = Harness::new();
    let info = h.driver.volume_info();
    assert_eq!(info.volume_label, "WebDAV");
    assert_eq!(info.total_size, 500_000 * u64::from(u32::MAX));
    assert_eq!(info.free_size, info.total_size);

    let relabeled = h.driver.set_volume_label("Team Docs");
    assert_eq!(relabeled.volume_label, "Team Docs");
    assert_eq!(h.driver.volume_info().volume_label, "Team Docs");
}
