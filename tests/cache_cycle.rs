mod common;

use std::{collections::BTreeSet, sync::Arc};

use chrono::{TimeDelta, Utc};
use framecast::{CacheScanner, Resolution, store::PlaybackStats};

use common::{ramp, scanner, scanner_config, write_gif};

const RES: Resolution = Resolution {
    width: 32,
    height: 32,
};

fn name(i: usize) -> String {
    format!("anim_{i:02}")
}

fn add_sources(root: &std::path::Path, n: usize, frames: u32) {
    for i in 0..n {
        write_gif(
            &root.join("gifs").join(format!("{}.gif", name(i))),
            32,
            32,
            &ramp(frames),
        );
    }
}

fn cached_names(scanner: &CacheScanner) -> BTreeSet<String> {
    scanner
        .store()
        .cache_entries_at(RES)
        .unwrap()
        .into_iter()
        .map(|e| e.asset_name)
        .collect()
}

/// Mark the cache entry of `asset` as played once, ending at `at`.
fn play_cached(scanner: &CacheScanner, asset: &str, at: chrono::DateTime<Utc>, fps: f64) {
    let store = scanner.store();
    let record = store.asset_by_name(asset).unwrap().unwrap();
    let entry = store.acquire_playback(&record, RES, 1).unwrap().unwrap();
    store
        .release_playback(
            entry.id,
            Some(PlaybackStats {
                frames_sent: entry.frame_count,
                fps,
            }),
            at,
        )
        .unwrap();
}

#[test]
fn twenty_five_assets_cache_the_twenty_least_played() {
    let tmp = tempfile::tempdir().unwrap();
    let scanner = scanner(tmp.path(), 20);
    add_sources(tmp.path(), 25, 2);

    let t0 = Utc::now();
    let report = scanner.scan_at(t0).unwrap();
    assert_eq!(report.added, 25);

    // anim_i has 24 - i plays, so the twenty least played are anim_05..anim_24.
    let store = scanner.store();
    for i in 0..25 {
        let asset = store.asset_by_name(&name(i)).unwrap().unwrap();
        for _ in 0..(24 - i) {
            store.record_play(asset.id, t0).unwrap();
        }
    }

    let report = scanner.run_pass_at(t0).unwrap();
    assert_eq!(report.populated[&RES].built, 20);

    let expected: BTreeSet<String> = (5..25).map(name).collect();
    assert_eq!(cached_names(&scanner), expected);
    for i in 0..25 {
        assert_eq!(scanner.cache().has_asset(RES, &name(i)), i >= 5, "{}", name(i));
    }
    assert!(
        store
            .cache_entries_at(RES)
            .unwrap()
            .iter()
            .all(|e| !e.scheduled_for_deletion && e.frame_count == 2)
    );

    // A second pass with nothing changed leaves the cache alone.
    let report = scanner.run_pass_at(t0).unwrap();
    assert_eq!(report.scan.unchanged, 25);
    assert_eq!(report.populated[&RES].built, 0);
    assert_eq!(cached_names(&scanner), expected);
}

#[test]
fn rotation_replaces_stale_played_entries_without_growing() {
    let tmp = tempfile::tempdir().unwrap();
    let scanner = scanner(tmp.path(), 4);
    add_sources(tmp.path(), 6, 2);

    let t0 = Utc::now();
    scanner.run_pass_at(t0).unwrap();
    assert_eq!(
        cached_names(&scanner),
        (0..4).map(name).collect::<BTreeSet<_>>()
    );

    // anim_00 and anim_01 get played a lot; the least played four become 02..05.
    let store = scanner.store();
    for i in 0..2 {
        play_cached(&scanner, &name(i), t0, 0.001);
        let asset = store.asset_by_name(&name(i)).unwrap().unwrap();
        for _ in 0..10 {
            store.record_play(asset.id, t0).unwrap();
        }
    }

    // Played a minute ago: not stale yet, so nothing can be replaced.
    let report = scanner.run_pass_at(t0 + TimeDelta::minutes(1)).unwrap();
    assert_eq!(report.populated[&RES].deferred, 2);
    assert_eq!(store.cache_entries_at(RES).unwrap().len(), 4);
    assert!(cached_names(&scanner).contains(&name(0)));

    // Two hours later both played entries are stale and give their slots away.
    let report = scanner.run_pass_at(t0 + TimeDelta::hours(2)).unwrap();
    assert_eq!(report.populated[&RES].replaced, 2);
    assert_eq!(
        cached_names(&scanner),
        (2..6).map(name).collect::<BTreeSet<_>>()
    );
    assert!(!scanner.cache().has_asset(RES, &name(0)));
    assert!(!scanner.cache().has_asset(RES, &name(1)));
    assert!(store.cache_entries_at(RES).unwrap().len() <= 4);
}

#[test]
fn measured_loop_time_makes_entries_stale_early() {
    let tmp = tempfile::tempdir().unwrap();
    let scanner = scanner(tmp.path(), 1);
    add_sources(tmp.path(), 2, 2);

    let t0 = Utc::now();
    scanner.run_pass_at(t0).unwrap();
    assert_eq!(cached_names(&scanner), BTreeSet::from([name(0)]));

    // Two frames at 10 fps: three loops take 0.6 s, so a minute idle is stale.
    play_cached(&scanner, &name(0), t0, 10.0);
    let asset = scanner.store().asset_by_name(&name(0)).unwrap().unwrap();
    scanner.store().record_play(asset.id, t0).unwrap();

    let report = scanner.run_pass_at(t0 + TimeDelta::minutes(1)).unwrap();
    assert_eq!(report.populated[&RES].replaced, 1);
    assert_eq!(cached_names(&scanner), BTreeSet::from([name(1)]));
}

#[test]
fn unplayed_entries_survive_eviction_pressure() {
    let tmp = tempfile::tempdir().unwrap();
    let wide = scanner(tmp.path(), 3);
    add_sources(tmp.path(), 4, 2);
    let t0 = Utc::now();
    wide.run_pass_at(t0).unwrap();
    assert_eq!(wide.store().cache_entries_at(RES).unwrap().len(), 3);

    // Same catalog and cache, tighter limit: two entries fall outside the protected set.
    let narrow = CacheScanner::new(Arc::clone(wide.store()), scanner_config(tmp.path(), 1));
    for days in [1, 30, 365] {
        let report = narrow.run_pass_at(t0 + TimeDelta::days(days)).unwrap();
        assert_eq!(report.evicted[&RES].scheduled, 0);
        assert_eq!(report.evicted[&RES].deleted, 0);
    }
    let entries = wide.store().cache_entries_at(RES).unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| !e.scheduled_for_deletion));
}

#[test]
fn playing_entry_is_never_deleted_under_a_stream() {
    let tmp = tempfile::tempdir().unwrap();
    let wide = scanner(tmp.path(), 2);
    add_sources(tmp.path(), 3, 2);
    let t0 = Utc::now();
    wide.run_pass_at(t0).unwrap();
    assert_eq!(
        cached_names(&wide),
        BTreeSet::from([name(0), name(1)])
    );

    let store = Arc::clone(wide.store());
    // Keep anim_00 the least played so the narrow scanner selects it.
    for i in 1..3 {
        let asset = store.asset_by_name(&name(i)).unwrap().unwrap();
        store.record_play(asset.id, t0).unwrap();
    }
    play_cached(&wide, &name(0), t0, 15.0);
    play_cached(&wide, &name(1), t0 - TimeDelta::hours(1), 15.0);

    // A stream starts reading anim_01 and is still going when the pass runs.
    let b = store.asset_by_name(&name(1)).unwrap().unwrap();
    let reading = store.acquire_playback(&b, RES, 2).unwrap().unwrap();

    let narrow = CacheScanner::new(Arc::clone(&store), scanner_config(tmp.path(), 1));
    let report = narrow.run_pass_at(t0 + TimeDelta::hours(2)).unwrap();
    assert_eq!(report.evicted[&RES].deleted, 0);
    assert_eq!(report.evicted[&RES].busy, 1);

    let entry = store.cache_entry_for(b.id, RES).unwrap().unwrap();
    assert!(entry.scheduled_for_deletion);
    assert!(narrow.cache().has_asset(RES, &name(1)));
    // Scheduled entries are not handed to new streams.
    assert!(store.acquire_playback(&b, RES, 1).unwrap().is_none());

    store.release_playback(reading.id, None, t0).unwrap();
    let report = narrow.run_pass_at(t0 + TimeDelta::hours(2)).unwrap();
    assert_eq!(report.evicted[&RES].deleted, 1);
    assert!(store.cache_entry_for(b.id, RES).unwrap().is_none());
    assert!(!narrow.cache().has_asset(RES, &name(1)));
}

#[test]
fn small_resolution_never_keeps_anything_scheduled() {
    let tmp = tempfile::tempdir().unwrap();
    let scanner = scanner(tmp.path(), 5);
    add_sources(tmp.path(), 3, 2);
    let t0 = Utc::now();
    scanner.run_pass_at(t0).unwrap();

    play_cached(&scanner, &name(0), t0, 15.0);
    let store = scanner.store();
    for entry in store.cache_entries_at(RES).unwrap() {
        store.set_scheduled(entry.id, true).unwrap();
    }

    let report = scanner.run_pass_at(t0 + TimeDelta::days(2)).unwrap();
    assert_eq!(report.evicted[&RES].deleted, 0);
    let entries = store.cache_entries_at(RES).unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| !e.scheduled_for_deletion));
}

#[test]
fn modified_source_is_rebuilt() {
    let tmp = tempfile::tempdir().unwrap();
    let scanner = scanner(tmp.path(), 20);
    let path = tmp.path().join("gifs").join("aurora.gif");
    write_gif(&path, 32, 32, &ramp(3));
    let t0 = Utc::now();
    scanner.run_pass_at(t0).unwrap();

    let store = scanner.store();
    let before = store.asset_by_name("aurora").unwrap().unwrap();
    assert_eq!(
        store.cache_entry_for(before.id, RES).unwrap().unwrap().frame_count,
        3
    );

    write_gif(&path, 32, 32, &ramp(5));
    let report = scanner.run_pass_at(t0 + TimeDelta::minutes(5)).unwrap();
    assert_eq!(report.scan.modified, 1);

    let after = store.asset_by_name("aurora").unwrap().unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.first_seen, before.first_seen);
    assert_eq!(after.n_frames, 5);
    assert_ne!(after.checksum, before.checksum);

    let entry = store.cache_entry_for(after.id, RES).unwrap().unwrap();
    assert_eq!(entry.frame_count, 5);
    assert_eq!(entry.source_checksum, after.checksum);
    assert!(scanner.cache().frame_path(RES, "aurora", 4).is_file());
}

#[test]
fn removed_source_leaves_no_trace() {
    let tmp = tempfile::tempdir().unwrap();
    let scanner = scanner(tmp.path(), 20);
    add_sources(tmp.path(), 2, 2);
    let t0 = Utc::now();
    scanner.run_pass_at(t0).unwrap();
    assert!(scanner.cache().has_asset(RES, &name(1)));

    std::fs::remove_file(tmp.path().join("gifs").join(format!("{}.gif", name(1)))).unwrap();
    let report = scanner.run_pass_at(t0).unwrap();
    assert_eq!(report.scan.removed, 1);
    assert_eq!(report.evicted[&RES].orphans, 1);
    assert!(scanner.store().asset_by_name(&name(1)).unwrap().is_none());
    assert_eq!(cached_names(&scanner), BTreeSet::from([name(0)]));
    assert!(!scanner.cache().has_asset(RES, &name(1)));
}

#[test]
fn unreadable_sources_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let scanner = scanner(tmp.path(), 20);
    add_sources(tmp.path(), 1, 2);
    std::fs::write(tmp.path().join("gifs").join("broken.gif"), b"GIF89a nope").unwrap();

    let report = scanner.run_pass_at(Utc::now()).unwrap();
    assert_eq!(report.scan.added, 1);
    assert_eq!(report.scan.skipped, 1);
    assert!(scanner.store().asset_by_name("broken").unwrap().is_none());
    assert_eq!(cached_names(&scanner), BTreeSet::from([name(0)]));
}

#[test]
fn filename_hint_sets_catalog_resolution() {
    let tmp = tempfile::tempdir().unwrap();
    let scanner = scanner(tmp.path(), 20);
    write_gif(
        &tmp.path().join("gifs").join("wide_64x16.gif"),
        32,
        32,
        &ramp(2),
    );
    scanner.run_pass_at(Utc::now()).unwrap();

    let wide = Resolution::new(64, 16).unwrap();
    let asset = scanner.store().asset_by_name("wide_64x16").unwrap().unwrap();
    assert_eq!(asset.resolution(), wide);
    let entry = scanner.store().cache_entry_for(asset.id, wide).unwrap().unwrap();
    let frame = std::fs::read(scanner.cache().frame_path(wide, "wide_64x16", 0)).unwrap();
    assert_eq!(entry.frame_count, 2);
    assert_eq!(frame.len(), wide.frame_len());
}
