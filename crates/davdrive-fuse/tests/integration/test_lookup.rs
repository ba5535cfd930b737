//! Lookup and directory enumeration through the metadata cache

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use davdrive_core::ports::RemoteError;
use davdrive_fuse::{DriveError, DriveEvent, FileSystemCallbacks};

use crate::common::{Harness, MockRepository};

fn populated() -> Arc<MockRepository> {
    let remote = Arc::new(MockRepository::new());
    remote.add_dir("docs");
    remote.add_file("docs/b.txt", b"bbb");
    remote.add_file("docs/a.txt", b"a");
    remote.add_dir("docs/sub");
    remote.add_file("top.txt", b"hello");
    remote
}

#[test]
fn test_second_open_is_served_from_cache() {
    let h = Harness::with_remote(populated(), |b| b);

    let first = h.driver.open("\\top.txt").unwrap();
    assert_eq!(first.info.file_size, 5);
    assert!(!first.info.is_directory());
    h.driver.close(&first.node);

    let second = h.driver.open("\\top.txt").unwrap();
    assert!(Arc::ptr_eq(&first.node, &second.node));
    assert_eq!(h.remote.calls("get_item"), 1);
    h.driver.close(&second.node);
}

#[test]
fn test_missing_path_is_remembered() {
    let h = Harness::new();

    assert!(matches!(
        h.driver.open("\\nope.txt"),
        Err(DriveError::NotFound(_))
    ));
    assert!(matches!(
        h.driver.resolve("\\nope.txt"),
        Err(DriveError::NotFound(_))
    ));
    assert_eq!(h.remote.calls("get_item"), 1);
}

#[test]
fn test_missing_entry_expires() {
    let h = Harness::with(|b| b.missing_ttl_secs(0));

    assert!(h.driver.open("\\later.txt").is_err());
    std::thread::sleep(std::time::Duration::from_millis(20));
    h.remote.add_file("later.txt", b"now");

    let opened = h.driver.open("\\later.txt").unwrap();
    assert_eq!(opened.info.file_size, 3);
    assert_eq!(h.remote.calls("get_item"), 2);
}

#[test]
fn test_ignored_names_never_reach_the_server() {
    let h = Harness::with_remote(populated(), |b| b);

    assert!(matches!(
        h.driver.open("\\desktop.ini"),
        Err(DriveError::NotFound(_))
    ));
    assert!(matches!(
        h.driver.open("\\docs\\Autorun.inf"),
        Err(DriveError::NotFound(_))
    ));
    assert_eq!(h.remote.calls("get_item"), 0);
}

#[test]
fn test_listing_is_sorted_and_resumable() {
    let h = Harness::with_remote(populated(), |b| b);
    let docs = h.driver.open("\\docs").unwrap().node;

    let names = h.list_names(&docs, None).unwrap();
    assert_eq!(names, vec![".", "..", "a.txt", "b.txt", "sub"]);

    let resumed = h.list_names(&docs, Some("a.txt")).unwrap();
    assert_eq!(resumed, vec!["b.txt", "sub"]);

    // The second scan is answered from the cache
    assert_eq!(h.remote.calls("list"), 1);

    // Children discovered by the listing resolve without a request
    let before = h.remote.calls("get_item");
    let child = h.driver.open("\\docs\\b.txt").unwrap();
    assert_eq!(child.info.file_size, 3);
    assert_eq!(h.remote.calls("get_item"), before);
}

#[test]
fn test_root_listing_has_no_dot_entries() {
    let h = Harness::with_remote(populated(), |b| b);
    let root = h.driver.open("\\").unwrap().node;

    let names = h.list_names(&root, None).unwrap();
    assert_eq!(names, vec!["docs", "top.txt"]);
}

#[test]
fn test_disabled_cache_lists_every_time() {
    let h = Harness::with_remote(populated(), |b| b.cache_enabled(false));
    let docs = h.driver.open("\\docs").unwrap().node;

    h.list_names(&docs, None).unwrap();
    h.list_names(&docs, None).unwrap();
    assert_eq!(h.remote.calls("list"), 2);
    assert!(h.driver.cache().is_empty());
}

#[test]
fn test_unauthorized_listing_clears_cache() {
    let mut h = Harness::with_remote(populated(), |b| b);
    let docs = h.driver.open("\\docs").unwrap().node;
    assert!(!h.driver.cache().is_empty());

    h.remote.fail("list", RemoteError::Unauthorized);
    assert!(matches!(
        h.list_names(&docs, None),
        Err(DriveError::NotFound(_))
    ));
    assert!(h.driver.cache().is_empty());

    let events = h.drain_events();
    assert!(events.contains(&DriveEvent::AuthenticationFailed));
    assert!(events.iter().any(|event| matches!(
        event,
        DriveEvent::Action(action) if action.method == "ReadDirectory" && !action.is_success()
    )));
}

#[test]
fn test_unauthorized_lookup_answers_not_found() {
    let mut h = Harness::with_remote(populated(), |b| b);
    h.remote.fail("get_item", RemoteError::Unauthorized);

    assert!(matches!(
        h.driver.open("\\top.txt"),
        Err(DriveError::NotFound(_))
    ));
    assert!(h.drain_events().contains(&DriveEvent::AuthenticationFailed));

    // Nothing was remembered as missing
    h.remote.heal("get_item");
    assert!(h.driver.open("\\top.txt").is_ok());
}

#[test]
fn test_unreachable_server_is_reported() {
    let h = Harness::with_remote(populated(), |b| b);
    h.remote.fail(
        "get_item",
        RemoteError::NetworkUnreachable("connection refused".to_string()),
    );

    assert!(matches!(
        h.driver.open("\\top.txt"),
        Err(DriveError::NetworkUnreachable(_))
    ));

    h.remote.heal("get_item");
    let opened = h.driver.open("\\top.txt").unwrap();
    assert_eq!(opened.info.file_size, 5);
}

#[test]
fn test_other_lookup_failures_count_as_missing() {
    let h = Harness::with_remote(populated(), |b| b);
    h.remote.fail_times(
        "get_item",
        RemoteError::Http {
            status: 500,
            message: "boom".to_string(),
        },
        1,
    );

    assert!(matches!(
        h.driver.open("\\top.txt"),
        Err(DriveError::NotFound(_))
    ));
    // Suppressed until the missing entry expires
    assert!(h.driver.open("\\top.txt").is_err());
    assert_eq!(h.remote.calls("get_item"), 1);
}

#[test]
fn test_stale_listing_refreshes_in_background() {
    let h = Harness::with_remote(populated(), |b| b.cache_ttl_secs(0));
    let docs = h.driver.open("\\docs").unwrap().node;
    h.list_names(&docs, None).unwrap();

    h.remote.add_file("docs/c.txt", b"late");
    std::thread::sleep(Duration::from_millis(20));

    // The stale listing is still answered from the cache
    let names = h.list_names(&docs, None).unwrap();
    assert_eq!(names, vec![".", "..", "a.txt", "b.txt", "sub"]);

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.driver.cache().lookup("\\docs\\c.txt").node().is_none() {
        assert!(Instant::now() < deadline, "directory was not refreshed");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(h.remote.calls("list") >= 2);
}
