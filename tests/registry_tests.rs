// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Catalog-level flows exercised through the facade with the engine running.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use offline_data_manager::{
    Event, FileRegistration, FixedProbe, ItemStatus, MemoryStore, StorageProbe, Store,
};

use common::{build_manager, fast_config, EventLog, MockFetcher, Route};

#[tokio::test]
async fn test_expired_payload_stays_retrievable_and_refreshes() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let fetcher = MockFetcher::new();
    fetcher.set_route("/report", Route::new(b"day-one".to_vec()));

    let manager = build_manager(store.clone(), fetcher.clone(), None, fast_config());
    let events = EventLog::attach(&manager);
    manager.start().await;

    manager
        .register_file(FileRegistration::new("report", "/report", 1).with_ttl(3600))
        .await?;
    events
        .wait_for(|e| matches!(e, Event::Complete { id, .. } if id == "report"))
        .await;

    // Rewind the expiry stamp instead of sleeping out a real TTL.
    let mut row = store.queue_get("report").await?.unwrap();
    row.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(5));
    store.queue_put(row).await?;

    let expired = manager.evaluate_expiry().await?;
    assert_eq!(expired, vec!["report"]);

    // Expired is still READY: the stale payload serves until the refresh.
    assert!(manager.is_ready("report").await?);
    assert_eq!(manager.retrieve("report").await?.data, b"day-one");
    assert_eq!(
        manager.get_status("report").await?.unwrap().status,
        ItemStatus::Expired
    );

    // Any wake lets the drain loop pick the expired row up for refresh.
    fetcher.set_route("/report", Route::new(b"day-two".to_vec()));
    events.clear();
    manager
        .register_file(FileRegistration::new("nudge", "/report", 1))
        .await?;

    events
        .wait_for(|e| matches!(e, Event::Complete { id, .. } if id == "report"))
        .await;
    assert_eq!(manager.retrieve("report").await?.data, b"day-two");

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_batch_reconciliation_end_to_end() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let fetcher = MockFetcher::new();
    for url in ["/a", "/b", "/keepsafe", "/new"] {
        fetcher.set_route(url, Route::new(url.as_bytes().to_vec()));
    }

    let manager = build_manager(store.clone(), fetcher.clone(), None, fast_config());
    let events = EventLog::attach(&manager);
    manager.start().await;

    manager
        .register_files(vec![
            FileRegistration::new("a", "/a", 1),
            FileRegistration::new("b", "/b", 1),
            FileRegistration::new("keepsafe", "/keepsafe", 1).protected(),
        ])
        .await?;
    for id in ["a", "b", "keepsafe"] {
        events
            .wait_for(|e| matches!(e, Event::Complete { id: done, .. } if done == id))
            .await;
    }

    // New catalog drops "b"; the protected row survives unmentioned.
    let result = manager
        .register_files(vec![
            FileRegistration::new("a", "/a", 1),
            FileRegistration::new("new", "/new", 1),
        ])
        .await?;
    assert_eq!(result.removed, vec!["b"]);

    events
        .wait_for(|e| matches!(e, Event::Complete { id, .. } if id == "new"))
        .await;

    assert!(store.registry_get("b").await?.is_none());
    assert!(manager.is_ready("keepsafe").await?);
    assert!(manager.is_ready("a").await?);

    // "a" was re-registered at the same version: no second download.
    assert_eq!(fetcher.get_count("/a"), 1);

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_get_all_status_attaches_storage_summary() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let fetcher = MockFetcher::new();
    fetcher.set_route("/s", Route::new(vec![1, 2, 3, 4]));

    let probe = Arc::new(FixedProbe::new(1_000_000));
    probe.set_usage(250_000);

    let manager = build_manager(
        store.clone(),
        fetcher.clone(),
        Some(probe as Arc<dyn StorageProbe>),
        fast_config(),
    );
    let events = EventLog::attach(&manager);
    manager.start().await;

    manager
        .register_file(FileRegistration::new("s", "/s", 1).with_total_bytes(4))
        .await?;
    events
        .wait_for(|e| matches!(e, Event::Complete { id, .. } if id == "s"))
        .await;

    let all = manager.get_all_status().await?;
    assert_eq!(all.items.len(), 1);
    assert_eq!(all.storage.quota, 1_000_000);
    assert_eq!(all.storage.usage, 250_000);
    assert_eq!(all.storage.available, 750_000);

    let view = &all.items[0];
    assert_eq!(view.status, ItemStatus::Complete);
    assert_eq!(view.percent, Some(100));
    assert_eq!(view.bytes_downloaded, 4);

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_metadata_update_does_not_disturb_downloads() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let fetcher = MockFetcher::new();
    fetcher.set_route("/meta", Route::new(vec![5; 8]));

    let manager = build_manager(store.clone(), fetcher.clone(), None, fast_config());
    let events = EventLog::attach(&manager);
    manager.start().await;

    manager
        .register_file(FileRegistration::new("meta", "/meta", 1))
        .await?;
    events
        .wait_for(|e| matches!(e, Event::Complete { id, .. } if id == "meta"))
        .await;

    manager
        .update_metadata("meta", serde_json::json!({"locale": "de-DE"}))
        .await?;

    let view = manager.get_status("meta").await?.unwrap();
    assert_eq!(view.metadata["locale"], serde_json::json!("de-DE"));
    assert_eq!(view.status, ItemStatus::Complete, "queue state untouched");
    assert!(manager.is_ready("meta").await?);

    // Give the loop a beat: no spurious re-download happens.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(fetcher.get_count("/meta"), 1);

    manager.stop().await;
    Ok(())
}
