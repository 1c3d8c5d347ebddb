//! Integration tests for watch mode: watch set diffs, reruns and bursts

mod common;

use common::{
    context, options, paths, recording_watcher, Recorder, RecordingDescriptor, RecordingPlugin,
    WatchLog,
};
use nimbus_host::WorkerHost;
use parking_lot::Mutex;
use serde_json::json;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_watch_set_is_diffed_between_reloads() {
    let temp = TempDir::new().unwrap();
    let a = temp.path().join("a.txt");
    let b = temp.path().join("b.txt");
    let c = temp.path().join("c.txt");

    let recorder = Recorder::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(WatchLog::default()));
    let host = WorkerHost::new(
        vec![RecordingDescriptor::new("p", &recorder).build()],
        context(&runs).with_watcher_factory(recording_watcher(&log)),
        options(json!({ "script": "ok", "watch": true, "paths": [a, b] })),
    )
    .await
    .expect("Failed to create host");

    assert!(host.is_watching().await);
    assert_eq!(host.watch_paths().await, paths(&[&a, &b]));

    host.set_options(options(json!({ "paths": [b, c] })))
        .await
        .expect("set_options failed");

    let log = log.lock();
    assert_eq!(log.created, 1);
    assert_eq!(log.watched, vec![paths(&[&a, &b]), paths(&[&c])]);
    assert_eq!(log.unwatched, vec![paths(&[&a])]);
    assert!(log.callback.is_some());
}

#[tokio::test]
async fn test_watch_mode_off_never_creates_watcher() {
    let recorder = Recorder::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(WatchLog::default()));
    let host = WorkerHost::new(
        vec![RecordingDescriptor::new("p", &recorder).build()],
        context(&runs).with_watcher_factory(recording_watcher(&log)),
        options(json!({ "script": "ok", "paths": ["/tmp/never-watched"] })),
    )
    .await
    .expect("Failed to create host");

    host.reload().await.unwrap();
    assert!(!host.is_watching().await);
    assert!(host.watch_paths().await.is_empty());
    assert_eq!(log.lock().created, 0);
}

#[tokio::test]
async fn test_watch_mode_is_latched_after_first_init() {
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(WatchLog::default()));
    let host = WorkerHost::new(
        vec![],
        context(&runs).with_watcher_factory(recording_watcher(&log)),
        options(json!({ "script": "ok" })),
    )
    .await
    .unwrap();

    host.set_options(options(json!({ "watch": true })))
        .await
        .unwrap();
    assert!(!host.is_watching().await);
    assert_eq!(log.lock().created, 0);
}

#[tokio::test]
async fn test_setup_path_change_reruns_setup_and_reloads() {
    let temp = TempDir::new().unwrap();
    let watched = temp.path().join("data.txt");

    let recorder = Recorder::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(WatchLog::default()));
    let host = WorkerHost::new(
        vec![
            RecordingDescriptor::new("a", &recorder).build(),
            RecordingDescriptor::new("b", &recorder).build(),
        ],
        context(&runs).with_watcher_factory(recording_watcher(&log)),
        options(json!({ "script": "ok", "watch": true, "paths": [watched] })),
    )
    .await
    .unwrap();

    recorder.clear();
    host.handle_file_change(&watched).await;

    let events = recorder.events();
    assert_eq!(&events[..2], ["setup(a)", "setup(b)"]);
    assert_eq!(recorder.count("beforeReload(a)"), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // Unrelated paths rerun nothing but still reload
    recorder.clear();
    host.handle_file_change(&temp.path().join("other.txt")).await;
    assert_eq!(recorder.count("setup(a)"), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_before_setup_change_reruns_script_setup() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("src");

    let recorder = Recorder::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(WatchLog::default()));
    let host = WorkerHost::new(
        vec![
            RecordingDescriptor::new("builder", &recorder)
                .before_setup_watch(vec![source.clone()])
                .build(),
            RecordingDescriptor::new("script", &recorder)
                .script("built")
                .build(),
        ],
        context(&runs).with_watcher_factory(recording_watcher(&log)),
        options(json!({ "watch": true })),
    )
    .await
    .unwrap();
    assert!(host.watch_paths().await.contains(&source));

    recorder.clear();
    host.handle_file_change(&source).await;

    let events = recorder.events();
    assert_eq!(&events[..2], ["beforeSetup(builder)", "setup(script)"]);
    assert_eq!(recorder.count("setup(builder)"), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_config_change_reinitialises() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("nimbus.toml");
    fs::write(&config, "[vars]\ngreeting = \"one\"\n").unwrap();

    let recorder = Recorder::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(WatchLog::default()));
    let host = WorkerHost::new(
        vec![RecordingDescriptor::new("a", &recorder).build()],
        context(&runs).with_watcher_factory(recording_watcher(&log)),
        options(json!({
            "script": "ok",
            "watch": true,
            "root_path": temp.path(),
            "config_path": true,
        })),
    )
    .await
    .unwrap();
    assert!(host.watch_paths().await.contains(&config));

    fs::write(&config, "[vars]\ngreeting = \"two\"\n").unwrap();
    host.handle_file_change(&config).await;

    let plugins = host.plugins().await;
    let plugin = plugins
        .get("a")
        .and_then(|plugin| plugin.downcast_ref::<RecordingPlugin>())
        .expect("Plugin a missing");
    assert_eq!(plugin.options["greeting"], json!("two"));
    drop(plugins);

    assert_eq!(recorder.count("new(a)"), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_burst_of_changes_reloads_once() {
    let temp = TempDir::new().unwrap();
    let watched = temp.path().join("data.txt");

    let recorder = Recorder::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(WatchLog::default()));
    let host = WorkerHost::new(
        vec![RecordingDescriptor::new("slow", &recorder)
            .setup_delay(Duration::from_millis(50))
            .build()],
        context(&runs).with_watcher_factory(recording_watcher(&log)),
        options(json!({ "script": "ok", "watch": true, "paths": [watched] })),
    )
    .await
    .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    tokio::join!(
        host.handle_file_change(&watched),
        host.handle_file_change(&watched)
    );

    // Both changes reran setup, only the last one reloaded
    assert_eq!(recorder.count("setup(slow)"), 3);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dispose_stops_watching() {
    let temp = TempDir::new().unwrap();
    let watched = temp.path().join("data.txt");

    let recorder = Recorder::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(WatchLog::default()));
    let host = WorkerHost::new(
        vec![RecordingDescriptor::new("a", &recorder).build()],
        context(&runs).with_watcher_factory(recording_watcher(&log)),
        options(json!({ "script": "ok", "watch": true, "paths": [watched] })),
    )
    .await
    .unwrap();

    host.dispose().await.unwrap();
    assert!(log.lock().disposed);
    assert!(host.watch_paths().await.is_empty());

    // Changes after dispose are ignored
    recorder.clear();
    host.handle_file_change(&watched).await;
    assert!(recorder.events().is_empty());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
