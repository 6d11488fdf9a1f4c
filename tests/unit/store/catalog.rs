use std::time::Duration;

use super::*;

fn scanned(name: &str, w: u32, h: u32, checksum: &str) -> ScannedAsset {
    ScannedAsset {
        name: name.to_string(),
        filename: format!("{name}.gif"),
        resolution: Resolution::new(w, h).unwrap(),
        n_frames: 4,
        checksum: checksum.to_string(),
    }
}

fn res32() -> Resolution {
    Resolution::new(32, 32).unwrap()
}

#[test]
fn upsert_sets_first_seen_only_on_insert() {
    let store = MetadataStore::in_memory().unwrap();
    let t0 = Utc::now() - chrono::Duration::hours(2);
    let t1 = Utc::now();

    let id = match store.upsert_asset(&scanned("a", 32, 32, "c1"), t0).unwrap() {
        UpsertOutcome::Inserted(id) => id,
        other => panic!("expected insert, got {other:?}"),
    };
    assert_eq!(
        store.upsert_asset(&scanned("a", 32, 32, "c1"), t1).unwrap(),
        UpsertOutcome::Unchanged(id)
    );
    assert_eq!(
        store.upsert_asset(&scanned("a", 64, 32, "c2"), t1).unwrap(),
        UpsertOutcome::Modified(id)
    );

    let rec = store.asset_by_name("a").unwrap().unwrap();
    assert_eq!(rec.first_seen, t0);
    assert_eq!(rec.checksum, "c2");
    assert_eq!(rec.width, 64);
}

#[test]
fn remove_assets_not_in_returns_dropped_rows() {
    let store = MetadataStore::in_memory().unwrap();
    let now = Utc::now();
    store.upsert_asset(&scanned("keep", 32, 32, "k"), now).unwrap();
    store.upsert_asset(&scanned("drop", 32, 32, "d"), now).unwrap();

    let present = HashSet::from(["keep.gif".to_string()]);
    let dropped = store.remove_assets_not_in(&present).unwrap();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].name, "drop");
    assert!(store.asset_by_name("drop").unwrap().is_none());
    assert!(store.asset_by_name("keep").unwrap().is_some());
}

#[test]
fn least_played_orders_by_count_then_recency() {
    let store = MetadataStore::in_memory().unwrap();
    let now = Utc::now();
    for name in ["a", "b", "c", "d"] {
        store.upsert_asset(&scanned(name, 32, 32, name), now).unwrap();
    }
    store.upsert_asset(&scanned("other", 16, 16, "o"), now).unwrap();

    let id = |n: &str| store.asset_by_name(n).unwrap().unwrap().id;
    store.record_play(id("a"), now - chrono::Duration::minutes(5)).unwrap();
    store.record_play(id("b"), now - chrono::Duration::minutes(10)).unwrap();
    store.record_play(id("c"), now).unwrap();
    store.record_play(id("c"), now).unwrap();

    let names: Vec<String> = store
        .least_played(res32(), 10)
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(names, vec!["d", "b", "a", "c"]);
    assert_eq!(store.least_played(res32(), 1).unwrap()[0].name, "d");
}

#[test]
fn cache_entries_are_unique_per_asset_and_resolution() {
    let store = MetadataStore::in_memory().unwrap();
    let now = Utc::now();
    store.upsert_asset(&scanned("a", 32, 32, "c"), now).unwrap();
    let a = store.asset_by_name("a").unwrap().unwrap();

    let first = store.put_cache_entry(&a, res32(), 4, now).unwrap();
    let second = store.put_cache_entry(&a, res32(), 4, now).unwrap();
    assert_ne!(first, second);
    assert_eq!(store.cache_entries_at(res32()).unwrap().len(), 1);

    let other = Resolution::new(16, 16).unwrap();
    store.put_cache_entry(&a, other, 4, now).unwrap();
    assert_eq!(store.cache_entries().unwrap().len(), 2);
}

#[test]
fn playback_accounting_updates_entry() {
    let store = MetadataStore::in_memory().unwrap();
    let now = Utc::now();
    store.upsert_asset(&scanned("a", 32, 32, "c"), now).unwrap();
    let a = store.asset_by_name("a").unwrap().unwrap();
    store.put_cache_entry(&a, res32(), 4, now).unwrap();

    let entry = store.acquire_playback(&a, res32(), 4).unwrap().unwrap();
    assert!(store.acquire_playback(&a, res32(), 5).unwrap().is_none());
    assert!(
        store
            .cache_entry_for(a.id, res32())
            .unwrap()
            .unwrap()
            .is_playing()
    );

    store
        .release_playback(
            entry.id,
            Some(PlaybackStats {
                frames_sent: 4,
                fps: 12.5,
            }),
            now,
        )
        .unwrap();
    let after = store.cache_entry_for(a.id, res32()).unwrap().unwrap();
    assert!(!after.is_playing());
    assert_eq!(after.play_count, 1);
    assert_eq!(after.avg_fps, Some(12.5));
    assert_eq!(after.last_used, Some(now));
}

#[test]
fn stale_checksum_entries_are_not_served() {
    let store = MetadataStore::in_memory().unwrap();
    let now = Utc::now();
    store.upsert_asset(&scanned("a", 32, 32, "old"), now).unwrap();
    let a = store.asset_by_name("a").unwrap().unwrap();
    store.put_cache_entry(&a, res32(), 4, now).unwrap();

    store.upsert_asset(&scanned("a", 32, 32, "new"), now).unwrap();
    let a = store.asset_by_name("a").unwrap().unwrap();
    assert!(store.acquire_playback(&a, res32(), 1).unwrap().is_none());
}

#[test]
fn eviction_never_removes_an_entry_with_readers() {
    let store = MetadataStore::in_memory().unwrap();
    let now = Utc::now();
    store.upsert_asset(&scanned("a", 32, 32, "c"), now).unwrap();
    let a = store.asset_by_name("a").unwrap().unwrap();
    let id = store.put_cache_entry(&a, res32(), 4, now).unwrap();

    let lease = store.acquire_playback(&a, res32(), 1).unwrap().unwrap();
    store.set_scheduled(id, true).unwrap();
    assert!(store.remove_if_evictable(id).unwrap().is_none());
    assert!(!store.claim_for_rebuild(id).unwrap());
    assert!(store.put_cache_entry(&a, res32(), 4, now).is_err());

    store.release_playback(lease.id, None, now).unwrap();
    assert!(store.remove_if_evictable(id).unwrap().is_some());
    assert!(store.cache_entry_for(a.id, res32()).unwrap().is_none());
}

#[test]
fn scheduled_entries_are_refused_to_new_streams() {
    let store = MetadataStore::in_memory().unwrap();
    let now = Utc::now();
    store.upsert_asset(&scanned("a", 32, 32, "c"), now).unwrap();
    let a = store.asset_by_name("a").unwrap().unwrap();
    let id = store.put_cache_entry(&a, res32(), 4, now).unwrap();

    assert!(store.claim_for_rebuild(id).unwrap());
    assert!(store.acquire_playback(&a, res32(), 1).unwrap().is_none());
}

#[test]
fn session_log_is_finalized_and_bounded() {
    let tmp = tempfile::tempdir().unwrap();
    let store = MetadataStore::open(tmp.path().join("catalog.db"), 2).unwrap();
    let now = Utc::now();
    store.upsert_asset(&scanned("a", 32, 32, "c"), now).unwrap();
    let a = store.asset_by_name("a").unwrap().unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            store
                .begin_session(
                    NewSession {
                        client_addr: "10.0.0.7".to_string(),
                        asset_id: a.id,
                        request: format!("STREAM:32:32:{i}-"),
                        frame_from: i,
                        frame_to: 3,
                        resolution: res32(),
                    },
                    now,
                )
                .unwrap(),
        );
    }
    store.finish_session(ids[2], 1, 14.0).unwrap();

    let sessions = store.sessions().unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, ids[1]);
    assert_eq!(sessions[1].frames_sent, Some(1));
    assert_eq!(sessions[0].frames_sent, None);
}

#[test]
fn catalog_survives_reopen_and_reset_clears_readers() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("nested").join("catalog.db");
    let now = Utc::now();
    {
        let store = MetadataStore::open(&path, 100).unwrap();
        store.upsert_asset(&scanned("a", 32, 32, "c"), now).unwrap();
        let a = store.asset_by_name("a").unwrap().unwrap();
        store.put_cache_entry(&a, res32(), 4, now).unwrap();
        store.acquire_playback(&a, res32(), 1).unwrap().unwrap();
    }

    let store = MetadataStore::open(&path, 100).unwrap();
    let a = store.asset_by_name("a").unwrap().unwrap();
    assert_eq!(a.first_seen, now);
    let entry = store.cache_entry_for(a.id, res32()).unwrap().unwrap();
    assert!(entry.is_playing());

    assert_eq!(store.reset_readers().unwrap(), 1);
    let entry = store.cache_entry_for(a.id, res32()).unwrap().unwrap();
    assert!(!entry.is_playing());
    assert!(!entry.is_stale(Utc::now(), Duration::from_secs(0)));
}

#[test]
fn two_handles_on_one_database_keep_each_others_writes() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("catalog.db");
    let now = Utc::now();
    let serve = MetadataStore::open(&path, 100).unwrap();
    let scan = MetadataStore::open(&path, 100).unwrap();

    serve.upsert_asset(&scanned("aurora", 32, 32, "a"), now).unwrap();
    let aurora = serve.asset_by_name("aurora").unwrap().unwrap();
    serve.record_play(aurora.id, now).unwrap();
    scan.upsert_asset(&scanned("comet", 32, 32, "c"), now).unwrap();
    scan.record_play(aurora.id, now).unwrap();

    drop((serve, scan));
    let reopened = MetadataStore::read_only(&path).unwrap();
    assert_eq!(
        reopened.asset_by_name("aurora").unwrap().unwrap().play_count,
        2
    );
    assert!(reopened.asset_by_name("comet").unwrap().is_some());
    assert!(reopened.record_play(aurora.id, now).is_err());
}

#[test]
fn record_play_on_a_removed_asset_is_not_found() {
    let store = MetadataStore::in_memory().unwrap();
    let now = Utc::now();
    store.upsert_asset(&scanned("a", 32, 32, "c"), now).unwrap();
    let a = store.asset_by_name("a").unwrap().unwrap();
    store.remove_assets_not_in(&HashSet::new()).unwrap();
    assert!(matches!(
        store.record_play(a.id, now),
        Err(FramecastError::NotFound(_))
    ));
}

#[test]
fn read_only_refuses_a_missing_database() {
    let tmp = tempfile::tempdir().unwrap();
    assert!(MetadataStore::read_only(tmp.path().join("nope.db")).is_err());
    assert!(!tmp.path().join("nope.db").exists());
}
