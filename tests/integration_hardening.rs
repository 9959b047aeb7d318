//! Hardening tests: crash recovery, corruption handling, and registry/id
//! boundary conditions.
//!
//! ## See also
//! - [`integration`] — basic CRUD, lifecycle, durability
//! - [`integration_coverage`] — count/cache/iteration edge cases

use std::fs;
use std::io::{Seek, SeekFrom, Write};

use tempfile::TempDir;
use tqdb::{Tqdb, TqdbConfig, TqdbError, TraitDescriptor};

#[derive(Clone, Debug, PartialEq)]
struct Widget {
    id: u32,
    name: String,
}

fn descriptor() -> TraitDescriptor<Widget> {
    TraitDescriptor {
        name: "Widget",
        max_count: 100_000,
        write: |w, e| {
            w.write_u32(e.id)?;
            w.write_str(&e.name)
        },
        read: |r| {
            Ok(Widget {
                id: r.read_u32()?,
                name: r.read_str()?,
            })
        },
        get_id: |e| e.id,
        set_id: |e, id| e.id = id,
        skip: None,
    }
}

fn config(dir: &std::path::Path) -> TqdbConfig {
    TqdbConfig {
        db_path: dir.join("widgets.tqdb"),
        ..TqdbConfig::default()
    }
}

// ================================================================================================
// Crash recovery at the atomic-swap boundary
// ================================================================================================

/// # Scenario
/// The main file is renamed to `.bak` (simulating a crash between the two
/// renames of the atomic swap) with no `.tmp` present.
///
/// # Expected behavior
/// The next open promotes `.bak` back to the main path and reads succeed.
#[test]
fn crash_with_only_bak_present_promotes_bak() {
    let dir = TempDir::new().unwrap();
    {
        let db = Tqdb::open(config(dir.path())).unwrap();
        db.register(descriptor()).unwrap();
        let mut w = Widget { id: 0, name: "a".into() };
        db.add(&mut w).unwrap();
    }

    let main = dir.path().join("widgets.tqdb");
    let bak = dir.path().join("widgets.tqdb.bak");
    fs::rename(&main, &bak).unwrap();
    assert!(!main.exists());

    let db = Tqdb::open(config(dir.path())).unwrap();
    db.register(descriptor()).unwrap();
    assert_eq!(db.get::<Widget>(1).unwrap().name, "a");
    assert!(main.exists());
}

/// # Scenario
/// A `.tmp` file is left behind (simulating a crash mid-rewrite, before
/// the first rename) while the main file is still intact.
///
/// # Expected behavior
/// The next open discards the stale `.tmp` and reads the untouched main
/// file.
#[test]
fn crash_with_stale_tmp_is_discarded() {
    let dir = TempDir::new().unwrap();
    let db = Tqdb::open(config(dir.path())).unwrap();
    db.register(descriptor()).unwrap();
    let mut w = Widget { id: 0, name: "a".into() };
    db.add(&mut w).unwrap();
    drop(db);

    let tmp = dir.path().join("widgets.tqdb.tmp");
    fs::write(&tmp, b"garbage").unwrap();

    let db = Tqdb::open(config(dir.path())).unwrap();
    db.register(descriptor()).unwrap();
    assert_eq!(db.get::<Widget>(1).unwrap().name, "a");
    assert!(!tmp.exists());
}

// ================================================================================================
// Corruption
// ================================================================================================

/// # Scenario
/// The main file's header magic bytes are overwritten.
///
/// # Expected behavior
/// Any read-path operation returns `Err(TqdbError::Corrupt(_))`.
#[test]
fn corrupt_magic_is_rejected() {
    let dir = TempDir::new().unwrap();
    let db = Tqdb::open(config(dir.path())).unwrap();
    db.register(descriptor()).unwrap();
    let mut w = Widget { id: 0, name: "a".into() };
    db.add(&mut w).unwrap();
    drop(db);

    let path = dir.path().join("widgets.tqdb");
    let mut file = fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(&[0, 0, 0, 0]).unwrap();
    drop(file);

    let db = Tqdb::open(config(dir.path())).unwrap();
    db.register(descriptor()).unwrap();
    assert!(matches!(db.get::<Widget>(1), Err(TqdbError::Corrupt(_))));
}

/// # Scenario
/// A WAL entry's trailing byte is flipped after an add, with no
/// checkpoint in between, before the process "crashes" and reopens.
///
/// # Expected behavior
/// Replay truncates at the corrupt entry rather than surfacing a CRC
/// error to the caller; any valid entries before it still replay.
#[test]
fn corrupt_wal_tail_truncates_but_does_not_fail_open() {
    let dir = TempDir::new().unwrap();
    let wal_cfg = || TqdbConfig {
        db_path: dir.path().join("widgets.tqdb"),
        enable_wal: true,
        wal_max_entries: 1_000_000,
        ..TqdbConfig::default()
    };
    {
        let db = Tqdb::open(wal_cfg()).unwrap();
        db.register(descriptor()).unwrap();
        let mut a = Widget { id: 0, name: "a".into() };
        let mut b = Widget { id: 0, name: "b".into() };
        db.add(&mut a).unwrap();
        db.add(&mut b).unwrap();
    }

    let wal_path = dir.path().join("widgets.tqdb.wal");
    let mut file = fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
    file.seek(SeekFrom::End(-1)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    drop(file);

    let db = Tqdb::open(wal_cfg()).unwrap();
    db.register(descriptor()).unwrap();
    assert_eq!(db.get::<Widget>(1).unwrap().name, "a");
}

// ================================================================================================
// Registry and id boundaries
// ================================================================================================

/// # Scenario
/// Calling `get`/`add`/`update`/`delete` for id `0`.
///
/// # Expected behavior
/// Every one of these rejects id `0` with `Err(TqdbError::InvalidArg(_))`,
/// since `0` is reserved to mean "unassigned" on the add path.
#[test]
fn zero_id_is_rejected_on_every_targeted_operation() {
    let dir = TempDir::new().unwrap();
    let db = Tqdb::open(config(dir.path())).unwrap();
    db.register(descriptor()).unwrap();

    assert!(matches!(db.get::<Widget>(0), Err(TqdbError::InvalidArg(_))));
    assert!(matches!(
        db.update::<Widget>(0, &Widget { id: 0, name: "x".into() }),
        Err(TqdbError::InvalidArg(_))
    ));
    assert!(matches!(db.delete::<Widget>(0), Err(TqdbError::InvalidArg(_))));
}

/// # Scenario
/// Registering up to the registry's capacity, then one more.
///
/// # Expected behavior
/// The call at capacity succeeds; the next one returns
/// `Err(TqdbError::Full)`.
#[test]
fn registry_rejects_types_past_capacity() {
    #[derive(Clone)]
    struct Tiny { id: u32 }

    fn tiny_descriptor(name: &'static str) -> TraitDescriptor<Tiny> {
        TraitDescriptor {
            name,
            max_count: 10,
            write: |w, e| w.write_u32(e.id),
            read: |r| Ok(Tiny { id: r.read_u32()? }),
            get_id: |e| e.id,
            set_id: |e, id| e.id = id,
            skip: None,
        }
    }

    let dir = TempDir::new().unwrap();
    let db = Tqdb::open(config(dir.path())).unwrap();
    for i in 0..8 {
        let name: &'static str = Box::leak(format!("Tiny{i}").into_boxed_str());
        db.register(tiny_descriptor(name)).unwrap();
    }
    assert!(matches!(
        db.register(tiny_descriptor("Overflow")),
        Err(TqdbError::Full)
    ));
}

/// # Scenario
/// Calling a typed operation for a type that was never registered on this
/// handle.
///
/// # Expected behavior
/// Returns `Err(TqdbError::NotRegistered(_))` rather than panicking.
#[test]
fn unregistered_type_is_rejected_not_panicking() {
    let dir = TempDir::new().unwrap();
    let db = Tqdb::open(config(dir.path())).unwrap();
    assert!(matches!(
        db.get::<Widget>(1),
        Err(TqdbError::NotRegistered(_))
    ));
}
