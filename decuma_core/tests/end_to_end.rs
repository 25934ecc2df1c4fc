//! End-to-end scenarios exercising `Database` as a whole: creation,
//! insertion across segment boundaries, recovery from the register, and
//! series lifecycle operations.

use decuma_core::database::Database;
use decuma_core::segment::{Conflict, When};
use decuma_core::EngineConfig;
use tempfile::tempdir;

fn config(dir: &std::path::Path) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.data_dir = dir.to_path_buf();
    // 48 bytes == three records of one 8-byte field; small enough to
    // exercise splits across the suite without splitting on every insert.
    cfg.max_segment_size = 48;
    cfg.max_segments_in_memory = 2;
    cfg.n_splits = 2;
    cfg
}

#[test]
fn create_series_insert_and_read_back() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(&config(dir.path())).unwrap();

    db.new_series("/sensors/a", vec!["value".to_string()]).unwrap();
    for t in 0..10 {
        db.insert("/sensors/a", t, vec![t as f64], Conflict::KeepBoth)
            .unwrap();
    }

    let (t, x) = db.get("/sensors/a", 5, None, When::Exact).unwrap();
    assert_eq!(t, 5);
    assert_eq!(x, vec![5.0]);

    let (times, _) = db.get_all("/sensors/a", None).unwrap();
    assert_eq!(times, (0..10).collect::<Vec<_>>());
}

#[test]
fn keep_both_orders_new_record_before_existing_at_same_timestamp() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(&config(dir.path())).unwrap();
    db.new_series("/dup", vec!["v".to_string()]).unwrap();

    db.insert("/dup", 100, vec![1.0], Conflict::KeepBoth).unwrap();
    db.insert("/dup", 100, vec![2.0], Conflict::KeepBoth).unwrap();

    let (times, rows) = db.get_range("/dup", 100, 100, None).unwrap();
    assert_eq!(times, vec![100, 100]);
    assert_eq!(rows, vec![vec![2.0], vec![1.0]]);
}

#[test]
fn recovery_reconstructs_series_after_reopen() {
    let dir = tempdir().unwrap();
    {
        let mut db = Database::open(&config(dir.path())).unwrap();
        db.new_series("/p", vec!["v".to_string()]).unwrap();
        for t in 0..20 {
            db.insert("/p", t, vec![t as f64], Conflict::KeepBoth).unwrap();
        }
        db.shutdown().unwrap();
    }

    let mut reopened = Database::open(&config(dir.path())).unwrap();
    let (times, rows) = reopened.get_all("/p", None).unwrap();
    assert_eq!(times, (0..20).collect::<Vec<_>>());
    assert_eq!(rows.len(), 20);
}

#[test]
fn deleted_series_does_not_survive_recovery() {
    let dir = tempdir().unwrap();
    {
        let mut db = Database::open(&config(dir.path())).unwrap();
        db.new_series("/gone", vec!["v".to_string()]).unwrap();
        db.insert("/gone", 0, vec![1.0], Conflict::KeepBoth).unwrap();
        db.delete_series("/gone").unwrap();
    }

    let reopened = Database::open(&config(dir.path())).unwrap();
    assert!(reopened.get_fields("/gone").is_err());
}

#[test]
fn move_series_preserves_data_under_new_path() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(&config(dir.path())).unwrap();
    db.new_series("/old", vec!["v".to_string()]).unwrap();
    db.insert("/old", 0, vec![9.0], Conflict::KeepBoth).unwrap();

    db.move_series("/old", "/new").unwrap();

    assert!(db.get_fields("/old").is_err());
    let (t, x) = db.get("/new", 0, None, When::Exact).unwrap();
    assert_eq!(t, 0);
    assert_eq!(x, vec![9.0]);
}

#[test]
fn move_survives_recovery_under_new_path_only() {
    let dir = tempdir().unwrap();
    {
        let mut db = Database::open(&config(dir.path())).unwrap();
        db.new_series("/old", vec!["v".to_string()]).unwrap();
        db.insert("/old", 0, vec![9.0], Conflict::KeepBoth).unwrap();
        db.move_series("/old", "/new").unwrap();
        db.shutdown().unwrap();
    }

    let reopened = Database::open(&config(dir.path())).unwrap();
    assert!(reopened.get_fields("/old").is_err());
    assert!(reopened.get_fields("/new").is_ok());
}

#[test]
fn rename_fields_updates_projection_names() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(&config(dir.path())).unwrap();
    db.new_series("/r", vec!["old_name".to_string()]).unwrap();
    db.insert("/r", 0, vec![3.0], Conflict::KeepBoth).unwrap();

    db.rename_fields("/r", vec!["new_name".to_string()]).unwrap();
    let (_, x) = db
        .get("/r", 0, Some(&["new_name".to_string()]), When::Exact)
        .unwrap();
    assert_eq!(x, vec![3.0]);
}

#[test]
fn defragment_collapses_many_segments_into_one() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(&config(dir.path())).unwrap();
    db.new_series("/frag", vec!["v".to_string()]).unwrap();
    for t in 0..30 {
        db.insert("/frag", t, vec![t as f64], Conflict::KeepBoth)
            .unwrap();
    }
    let before = db.toc(&[]).children.get("frag").unwrap().series.clone().unwrap();
    assert!(before.segment_count > 1);

    db.defragment_series("/frag").unwrap();
    let after = db.toc(&[]).children.get("frag").unwrap().series.clone().unwrap();
    assert_eq!(after.segment_count, 1);

    let (times, _) = db.get_all("/frag", None).unwrap();
    assert_eq!(times, (0..30).collect::<Vec<_>>());
}

#[test]
fn compact_register_preserves_readable_state() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(&config(dir.path())).unwrap();
    db.new_series("/a", vec!["v".to_string()]).unwrap();
    db.insert("/a", 0, vec![1.0], Conflict::KeepBoth).unwrap();
    db.new_series("/b", vec!["v".to_string()]).unwrap();
    db.delete_series("/b").unwrap();

    db.compact_register().unwrap();

    let reopened = Database::open(&config(dir.path())).unwrap();
    assert!(reopened.get_fields("/a").is_ok());
    assert!(reopened.get_fields("/b").is_err());
}

#[test]
fn toc_builds_nested_hierarchy_by_path_component() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(&config(dir.path())).unwrap();
    db.new_series("/x/y/z", vec!["v".to_string()]).unwrap();
    db.insert("/x/y/z", 0, vec![1.0], Conflict::KeepBoth).unwrap();

    let root = db.toc(&[]);
    let x = root.children.get("x").unwrap();
    assert!(x.series.is_none());
    let y = x.children.get("y").unwrap();
    assert!(y.series.is_none());
    let z = y.children.get("z").unwrap();
    let info = z.series.as_ref().unwrap();
    assert_eq!(info.path, "/x/y/z");
    assert_eq!(info.segment_count, 1);
}

#[test]
fn toc_prefix_scopes_to_subtree() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(&config(dir.path())).unwrap();
    db.new_series("/x/y/z", vec!["v".to_string()]).unwrap();
    db.new_series("/x/other", vec!["v".to_string()]).unwrap();
    db.new_series("/elsewhere", vec!["v".to_string()]).unwrap();

    let scoped = db.toc(&["x".to_string()]);
    assert!(scoped.children.contains_key("y"));
    assert!(scoped.children.contains_key("other"));
    assert!(!scoped.children.contains_key("elsewhere"));
}

#[test]
fn insert_into_unknown_series_is_an_error() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(&config(dir.path())).unwrap();
    assert!(db
        .insert("/nope", 0, vec![1.0], Conflict::KeepBoth)
        .is_err());
}

#[test]
fn creating_duplicate_series_is_an_error() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(&config(dir.path())).unwrap();
    db.new_series("/dup", vec!["v".to_string()]).unwrap();
    assert!(db.new_series("/dup", vec!["v".to_string()]).is_err());
}
