//! Crash-recovery and retention flows through the full database
//! facade: WAL replay after an unclean shutdown, replay idempotence
//! and fixed-store volume recycling.

use std::fs;
use std::path::Path;

use nacre_common::{PayloadValue, Sample};
use nacre_db::{Database, DbConfig, WalConfig};
use nacre_query::{OrderBy, QueryRequest, TimeRange};
use tempfile::TempDir;

fn small_config() -> DbConfig {
    DbConfig {
        nvolumes: 4,
        volume_capacity: 512,
        expandable: false,
        wal: Some(WalConfig {
            concurrency: 2,
            max_volumes: 4,
            volume_size: 16 * 1024 * 1024,
        }),
    }
}

fn scan_all(db: &Database, id: u64, from: u64, to: u64) -> Vec<Sample> {
    let req = QueryRequest::scan(vec![id], TimeRange { from, to }, OrderBy::Series);
    db.query(&req).expect("query").collect_all().expect("collect")
}

fn copy_dir(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).expect("mkdir");
    for entry in fs::read_dir(src).expect("read_dir") {
        let entry = entry.expect("entry");
        if entry.file_type().expect("type").is_file() {
            fs::copy(entry.path(), dst.join(entry.file_name())).expect("copy");
        }
    }
}

fn clear_dir(dir: &Path) {
    for entry in fs::read_dir(dir).expect("read_dir") {
        let entry = entry.expect("entry");
        if entry.file_type().expect("type").is_file() {
            fs::remove_file(entry.path()).expect("remove");
        }
    }
}

#[test]
fn wal_replay_recovers_unclosed_writes() {
    let dir = TempDir::new().expect("tempdir");
    let n = 10_000u64;
    {
        let db = Database::create(dir.path(), &small_config()).expect("create");
        let mut session = db.session();
        let id = session.init_series_id("cpu.user host=alpha").expect("series");
        for ts in 0..n {
            session
                .write(&Sample::float(id, ts, ts as f64 * 0.5))
                .expect("write");
        }
        session.close().expect("session close");
        // No db.close(): simulate a crash. The WAL survives on disk.
        drop(db);
    }
    let db = Database::open(dir.path()).expect("reopen");
    let id = db.get_series_ids(&["cpu.user host=alpha"]).expect("ids")[0];
    let out = scan_all(&db, id, 0, n + 1);
    assert_eq!(out.len() as u64, n, "all points recovered from the WAL");
    for (ix, sample) in out.iter().enumerate() {
        assert_eq!(sample.timestamp, ix as u64);
        assert_eq!(
            sample.payload,
            PayloadValue::Float(ix as f64 * 0.5),
            "sample {ix} has the wrong value"
        );
    }
    db.close().expect("close");
}

#[test]
fn recovery_is_idempotent() {
    let dir = TempDir::new().expect("tempdir");
    let snapshot = TempDir::new().expect("tempdir");
    {
        let db = Database::create(dir.path(), &small_config()).expect("create");
        let mut session = db.session();
        let id = session.init_series_id("mem.free host=beta").expect("series");
        for ts in 0..5000u64 {
            session.write(&Sample::float(id, ts, 1.0)).expect("write");
        }
        session.close().expect("session close");
        drop(db);
    }
    // Crash state frozen on the side.
    copy_dir(dir.path(), snapshot.path());

    let first = {
        let db = Database::open(dir.path()).expect("first recovery");
        let id = db.get_series_ids(&["mem.free host=beta"]).expect("ids")[0];
        let out = scan_all(&db, id, 0, 10_000);
        db.close().expect("close");
        out
    };

    // Restore the crash state and recover again from scratch.
    clear_dir(dir.path());
    copy_dir(snapshot.path(), dir.path());
    let second = {
        let db = Database::open(dir.path()).expect("second recovery");
        let id = db.get_series_ids(&["mem.free host=beta"]).expect("ids")[0];
        let out = scan_all(&db, id, 0, 10_000);
        db.close().expect("close");
        out
    };
    assert_eq!(first.len(), 5000);
    assert_eq!(first, second, "recovery must be deterministic");
}

#[test]
fn clean_close_leaves_no_wal_and_reopens() {
    let dir = TempDir::new().expect("tempdir");
    {
        let db = Database::create(dir.path(), &small_config()).expect("create");
        let mut session = db.session();
        let id = session.init_series_id("disk.io host=gamma").expect("series");
        for ts in 100..200u64 {
            session.write(&Sample::float(id, ts, 2.0)).expect("write");
        }
        session.close().expect("session close");
        db.close().expect("close");
    }
    // A graceful close removes the log volumes.
    let leftovers = fs::read_dir(dir.path())
        .expect("read_dir")
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|n| n.ends_with(".ils"))
                .unwrap_or(false)
        })
        .count();
    assert_eq!(leftovers, 0);

    let db = Database::open(dir.path()).expect("reopen");
    let id = db.get_series_ids(&["disk.io host=gamma"]).expect("ids")[0];
    let out = scan_all(&db, id, 0, 1000);
    assert_eq!(out.len(), 100);
    assert_eq!(out[0].timestamp, 100);
    db.close().expect("close");
}

#[test]
fn recycled_volumes_keep_only_the_recent_tail() {
    let dir = TempDir::new().expect("tempdir");
    // Two volumes of eight blocks each, no WAL: history is bounded to
    // sixteen committed nodes.
    let config = DbConfig {
        nvolumes: 2,
        volume_capacity: 8,
        expandable: false,
        wal: None,
    };
    let n = 40_000u64;
    let db = Database::create(dir.path(), &config).expect("create");
    let mut session = db.session();
    let id = session.init_series_id("net.rx host=delta").expect("series");
    for ts in 0..n {
        session
            .write(&Sample::float(id, ts, ts as f64 * 0.1))
            .expect("write");
    }
    let out = scan_all(&db, id, 0, n + 1);
    assert!(!out.is_empty());
    assert!(
        (out.len() as u64) < n,
        "recycling must have dropped old history"
    );
    // The surviving samples are the newest contiguous tail.
    let last = out.last().expect("tail");
    assert_eq!(last.timestamp, n - 1);
    for pair in out.windows(2) {
        assert_eq!(pair[1].timestamp, pair[0].timestamp + 1);
    }
    for sample in &out {
        assert_eq!(
            sample.payload,
            PayloadValue::Float(sample.timestamp as f64 * 0.1)
        );
    }
    db.close().expect("close");
}

#[test]
fn expandable_store_keeps_everything() {
    let dir = TempDir::new().expect("tempdir");
    let config = DbConfig {
        nvolumes: 1,
        volume_capacity: 8,
        expandable: true,
        wal: None,
    };
    let n = 20_000u64;
    let db = Database::create(dir.path(), &config).expect("create");
    let mut session = db.session();
    let id = session.init_series_id("temp host=eps").expect("series");
    for ts in 0..n {
        session.write(&Sample::float(id, ts, 1.5)).expect("write");
    }
    let out = scan_all(&db, id, 0, n + 1);
    assert_eq!(out.len() as u64, n);
    db.close().expect("close");
}
