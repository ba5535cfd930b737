//! Namespace operations: create, rename and delete

use std::sync::Arc;

use davdrive_core::{domain::ServerDialect, ports::RemoteError};
use davdrive_fuse::{CacheLookup, CleanupFlags, DriveError, DriveEvent, FileSystemCallbacks};

use crate::common::{Harness, MockRepository};

fn two_files() -> Arc<MockRepository> {
    let remote = Arc::new(MockRepository::new());
    remote.add_file("a.txt", b"from a");
    remote.add_file("b.txt", b"from b");
    remote
}

#[test]
fn test_rename_moves_cached_subtree() {
    let remote = Arc::new(MockRepository::new());
    remote.add_dir("old");
    remote.add_file("old/x.txt", b"x");
    let h = Harness::with_remote(remote, |b| b);

    let dir = h.driver.open("\\old").unwrap().node;
    h.list_names(&dir, None).unwrap();
    let child = h.driver.open("\\old\\x.txt").unwrap().node;

    h.driver.rename(&dir, "\\old", "\\new", false).unwrap();

    assert!(h.remote.exists("new/x.txt"));
    assert!(!h.remote.exists("old"));
    assert_eq!(dir.local_path(), "\\new");
    assert_eq!(child.local_path(), "\\new\\x.txt");
    assert_eq!(child.repository_path(), "/dav/new/x.txt");
    match h.driver.cache().lookup("\\new\\x.txt") {
        CacheLookup::Found(node) => assert!(Arc::ptr_eq(&node, &child)),
        other => panic!("expected cached child, got {:?}", other),
    }
    assert!(h.driver.cache().lookup("\\old").node().is_none());
}

#[test]
fn test_rename_onto_existing_without_replace_collides() {
    let h = Harness::with_remote(two_files(), |b| b);
    let a = h.driver.open("\\a.txt").unwrap().node;

    assert!(matches!(
        h.driver.rename(&a, "\\a.txt", "\\b.txt", false),
        Err(DriveError::NameCollision(_))
    ));
    assert_eq!(h.remote.calls("move_item"), 0);
    assert_eq!(h.remote.content("b.txt"), Some(b"from b".to_vec()));
}

#[test]
fn test_rename_never_replaces_a_directory() {
    let remote = two_files();
    remote.add_dir("folder");
    let h = Harness::with_remote(remote, |b| b);
    let a = h.driver.open("\\a.txt").unwrap().node;

    assert!(matches!(
        h.driver.rename(&a, "\\a.txt", "\\folder", true),
        Err(DriveError::NameCollision(_))
    ));
    assert_eq!(h.remote.calls("move_item"), 0);
}

#[test]
fn test_replace_relies_on_server_overwrite() {
    let h = Harness::with_remote(two_files(), |b| b);
    let a = h.driver.open("\\a.txt").unwrap().node;

    h.driver.rename(&a, "\\a.txt", "\\b.txt", true).unwrap();
    assert_eq!(h.remote.calls("delete_file"), 0);
    assert_eq!(h.remote.calls("move_item"), 1);
    assert_eq!(h.remote.content("b.txt"), Some(b"from a".to_vec()));
    assert!(!h.remote.exists("a.txt"));
}

#[test]
fn test_aos_replace_deletes_target_first() {
    let h = Harness::with_remote(two_files(), |b| b.dialect(ServerDialect::Aos));
    let a = h.driver.open("\\a.txt").unwrap().node;

    h.driver.rename(&a, "\\a.txt", "\\b.txt", true).unwrap();
    assert_eq!(h.remote.calls("delete_file"), 1);
    assert_eq!(h.remote.content("b.txt"), Some(b"from a".to_vec()));
}

#[test]
fn test_rename_flushes_local_changes_first() {
    let h = Harness::new();
    let created = h.driver.create("\\draft.txt", false, 0).unwrap();
    h.write(&created.node, 0, b"text").unwrap();

    h.driver
        .rename(&created.node, "\\draft.txt", "\\final.txt", false)
        .unwrap();

    assert_eq!(h.remote.content("final.txt"), Some(b"text".to_vec()));
    assert!(!h.remote.exists("draft.txt"));
    assert!(!created.node.has_unflushed_data());
    assert_eq!(created.node.name(), "final.txt");
}

#[test]
fn test_delete_file() {
    let mut h = Harness::with_remote(two_files(), |b| b);
    let a = h.driver.open("\\a.txt").unwrap().node;

    h.driver.can_delete(&a).unwrap();
    h.driver.cleanup(&a, CleanupFlags::delete());
    h.driver.close(&a);

    assert!(!h.remote.exists("a.txt"));
    assert!(a.is_deleted());
    assert!(h.drain_events().iter().any(|event| matches!(
        event,
        DriveEvent::Action(action) if action.method == "Delete" && action.is_success()
    )));
    assert!(matches!(
        h.driver.open("\\a.txt"),
        Err(DriveError::NotFound(_))
    ));
    assert!(matches!(h.driver.can_delete(&a), Err(DriveError::NotFound(_))));
}

#[test]
fn test_delete_directory_drops_subtree() {
    let remote = Arc::new(MockRepository::new());
    remote.add_dir("tree");
    remote.add_file("tree/leaf.txt", b"leaf");
    let h = Harness::with_remote(remote, |b| b);

    let dir = h.driver.open("\\tree").unwrap().node;
    h.list_names(&dir, None).unwrap();
    let leaf = h.driver.open("\\tree\\leaf.txt").unwrap().node;
    h.driver.close(&leaf);

    h.driver.cleanup(&dir, CleanupFlags::delete());
    h.driver.close(&dir);

    assert_eq!(h.remote.calls("delete_directory"), 1);
    assert!(!h.remote.exists("tree/leaf.txt"));
    assert!(h.driver.cache().lookup("\\tree\\leaf.txt").node().is_none());
}

#[test]
fn test_failed_delete_keeps_the_node() {
    let mut h = Harness::with_remote(two_files(), |b| b);
    let a = h.driver.open("\\a.txt").unwrap().node;

    h.remote.fail(
        "delete_file",
        RemoteError::Http {
            status: 423,
            message: "locked".to_string(),
        },
    );
    h.driver.cleanup(&a, CleanupFlags::delete());

    assert!(!a.is_deleted());
    assert!(h.remote.exists("a.txt"));
    assert!(h.drain_events().iter().any(|event| matches!(
        event,
        DriveEvent::Action(action) if action.method == "Delete" && !action.is_success()
    )));
}

#[test]
fn test_create_over_existing_collides() {
    let h = Harness::with_remote(two_files(), |b| b);

    assert!(matches!(
        h.driver.create("\\a.txt", false, 0),
        Err(DriveError::NameCollision(_))
    ));
    assert!(matches!(
        h.driver.create("\\b.txt", true, 0),
        Err(DriveError::NameCollision(_))
    ));
    assert_eq!(h.remote.calls("create_directory"), 0);
    assert_eq!(h.remote.calls("upload"), 0);
}

#[test]
fn test_new_directory_lists_without_server() {
    let h = Harness::new();
    let created = h.driver.create("\\fresh", true, 0).unwrap();
    assert!(created.info.is_directory());
    assert!(h.remote.exists("fresh"));

    let names = h.list_names(&created.node, None).unwrap();
    assert_eq!(names, vec![".", ".."]);
    assert_eq!(h.remote.calls("list"), 0);
}

#[test]
fn test_mkdir_conflict_without_target_is_access_denied() {
    let mut h = Harness::new();
    h.remote.fail("create_directory", RemoteError::Conflict("locked".to_string()));

    assert!(matches!(
        h.driver.create("\\locked", true, 0),
        Err(DriveError::AccessDenied(_))
    ));
    assert!(h.drain_events().iter().any(|event| matches!(
        event,
        DriveEvent::Action(action) if action.method == "Create" && !action.is_success()
    )));
}

#[test]
fn test_mkdir_conflict_after_race_is_name_collision() {
    let remote = Arc::new(MockRepository::new());
    remote.add_dir("raced");
    // The existence check misses the directory; the server then refuses
    remote.fail_times("get_item", RemoteError::NotFound("/dav/raced".to_string()), 1);
    let h = Harness::with_remote(remote, |b| b);

    assert!(matches!(
        h.driver.create("\\raced", true, 0),
        Err(DriveError::NameCollision(_))
    ));
    assert_eq!(h.remote.calls("get_item"), 2);
}
