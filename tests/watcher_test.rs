mod common;

use common::{connected, drain, errors, remote_id, MemoryServer};
use ferryfs::client::FileItem;
use ferryfs::config::PoolConfig;
use ferryfs::queue::upload::UploadJob;
use ferryfs::queue::{TransferOptions, TransferQueue};
use ferryfs::watcher::remote::RemoteWatcher;
use ferryfs::watcher::{ListingTransform, WatchEvent, Watchers};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn next(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> WatchEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no watch event")
        .expect("watch channel closed")
}

fn names(items: &[FileItem]) -> Vec<String> {
    items.iter().map(|item| item.name.clone()).collect()
}

#[tokio::test]
async fn test_refresh_cascades_to_watched_descendants() {
    let server = MemoryServer::new();
    server.add_dir("/p/q");
    server.add_dir("/other");
    let connections = connected(&server, PoolConfig::default()).await;
    let id = remote_id();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = RemoteWatcher::new(connections, tx, None);
    for path in ["/p", "/p/q", "/other"] {
        watcher.watch(&id, path).await;
        assert!(matches!(next(&mut rx).await, WatchEvent::Listing { .. }));
    }

    server.add_file("/p/q/new.txt", 3);
    watcher.refresh(&id, "/p").await;

    let mut listings = BTreeMap::new();
    for _ in 0..2 {
        match next(&mut rx).await {
            WatchEvent::Listing { target, items } => {
                listings.insert(target, names(&items));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(listings[&id.uri("/p")], vec!["q".to_string()]);
    assert_eq!(listings[&id.uri("/p/q")], vec!["new.txt".to_string()]);
    assert!(rx.try_recv().is_err(), "/other must not be re-listed");
}

#[tokio::test]
async fn test_vanished_directory_reports_missing() {
    let server = MemoryServer::new();
    server.add_dir("/p/q");
    let connections = connected(&server, PoolConfig::default()).await;
    let id = remote_id();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = RemoteWatcher::new(connections.clone(), tx, None);
    watcher.watch(&id, "/p").await;
    watcher.watch(&id, "/p/q").await;
    next(&mut rx).await;
    next(&mut rx).await;

    connections.shared(&id).unwrap().rm("/p/q", true).await.unwrap();
    watcher.refresh(&id, "/p").await;

    let mut missing = Vec::new();
    let mut listed = Vec::new();
    for _ in 0..2 {
        match next(&mut rx).await {
            WatchEvent::Missing { target } => missing.push(target),
            WatchEvent::Listing { target, items } => {
                assert!(items.is_empty());
                listed.push(target);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(missing, vec![id.uri("/p/q")]);
    assert_eq!(listed, vec![id.uri("/p")]);
    assert!(!watcher.is_watching(&id, "/p/q"));
    assert!(watcher.is_watching(&id, "/p"));
}

#[tokio::test]
async fn test_unwatch_is_refcounted() {
    let server = MemoryServer::new();
    server.add_dir("/shared");
    let connections = connected(&server, PoolConfig::default()).await;
    let id = remote_id();

    let (tx, _rx) = mpsc::unbounded_channel();
    let watcher = RemoteWatcher::new(connections, tx, None);
    watcher.watch(&id, "/shared").await;
    watcher.watch(&id, "/shared").await;

    watcher.unwatch(&id, "/shared");
    assert!(watcher.is_watching(&id, "/shared"));
    watcher.unwatch(&id, "/shared");
    assert!(!watcher.is_watching(&id, "/shared"));
}

struct HideDotfiles;

impl ListingTransform for HideDotfiles {
    fn transform(&self, _dir: &str, items: Vec<FileItem>) -> Vec<FileItem> {
        items
            .into_iter()
            .filter(|item| !item.name.starts_with('.'))
            .collect()
    }
}

#[tokio::test]
async fn test_transform_applies_to_listings() {
    let server = MemoryServer::new();
    server.add_file("/home/.profile", 1);
    server.add_file("/home/notes", 1);
    let connections = connected(&server, PoolConfig::default()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let transform: Arc<dyn ListingTransform> = Arc::new(HideDotfiles);
    let watcher = RemoteWatcher::new(connections, tx, Some(transform));
    watcher.watch(&remote_id(), "/home").await;

    match next(&mut rx).await {
        WatchEvent::Listing { items, .. } => {
            assert_eq!(names(&items), vec!["notes".to_string()]);
            assert!(items[0].uri.is_some());
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_finished_upload_refreshes_watched_listing() {
    let server = MemoryServer::new();
    server.add_dir("/inbox");
    let connections = connected(&server, PoolConfig::default()).await;
    let id = remote_id();

    let (watchers, mut rx) = Watchers::new(connections.clone(), None);
    watchers.remote.watch(&id, "/inbox").await;
    match next(&mut rx).await {
        WatchEvent::Listing { items, .. } => assert!(items.is_empty()),
        other => panic!("unexpected {:?}", other),
    }

    let temp_dir = tempfile::tempdir().unwrap();
    let file = temp_dir.path().join("hello.txt");
    std::fs::write(&file, b"hi").unwrap();

    let job = UploadJob::new(connections, id.clone(), Arc::new(watchers));
    let (_queue, mut events) = TransferQueue::spawn(
        Arc::new(job),
        vec![file.to_string_lossy().into_owned()],
        "/inbox".to_string(),
        TransferOptions::default(),
    )
    .await;
    assert!(errors(&drain(&mut events).await).is_empty());

    match next(&mut rx).await {
        WatchEvent::Listing { target, items } => {
            assert_eq!(target, id.uri("/inbox"));
            assert_eq!(names(&items), vec!["hello.txt".to_string()]);
        }
        other => panic!("unexpected {:?}", other),
    }
}
