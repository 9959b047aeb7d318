//! YCSB-style macro-benchmarks for TQDB.
//!
//! Measures sustained throughput under realistic mixed workloads inspired
//! by the Yahoo Cloud Serving Benchmark (YCSB), adapted to TQDB's
//! single-writer, id-keyed access pattern rather than YCSB's original
//! range-keyed store.
//!
//! # Workloads
//!
//! | Name | Mix | Description |
//! |------|-----|-------------|
//! | **A** | 50% read, 50% update | Session store — heavy read/write |
//! | **B** | 95% read, 5% update | Photo tagging — read-mostly |
//! | **C** | 100% read | User profile cache — read-only |
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench ycsb               # all workloads
//! cargo bench --bench ycsb -- "load"      # load phase only
//! cargo bench --bench ycsb -- "A"         # workload A only
//! ```

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};

use rand::Rng;
use std::hint::black_box;
use tempfile::TempDir;
use tqdb::{Tqdb, TqdbConfig, TraitDescriptor};

const RECORD_COUNT: u32 = 10_000;
const OPS_PER_RUN: u32 = 2_000;
const VALUE_SIZE: usize = 256;

#[derive(Clone)]
struct Record {
    id: u32,
    value: Vec<u8>,
}

fn descriptor() -> TraitDescriptor<Record> {
    TraitDescriptor {
        name: "Record",
        max_count: 1_000_000,
        write: |w, e| {
            w.write_u32(e.id)?;
            w.write_u16(e.value.len() as u16)?;
            w.write_raw(&e.value)
        },
        read: |r| {
            let id = r.read_u32()?;
            let len = r.read_u16()? as usize;
            let mut value = vec![0u8; len];
            r.read_raw(&mut value)?;
            Ok(Record { id, value })
        },
        get_id: |e| e.id,
        set_id: |e, id| e.id = id,
        skip: None,
    }
}

fn make_value(rng: &mut impl Rng) -> Vec<u8> {
    let mut buf = vec![0u8; VALUE_SIZE];
    rng.fill(&mut buf[..]);
    buf
}

fn load(dir: &std::path::Path) -> Tqdb {
    let db = Tqdb::open(TqdbConfig {
        db_path: dir.join("ycsb.tqdb"),
        enable_wal: true,
        wal_max_entries: 5_000,
        ..TqdbConfig::default()
    })
    .expect("open");
    db.register(descriptor()).expect("register");

    let mut rng = rand::rng();
    for _ in 0..RECORD_COUNT {
        let mut r = Record { id: 0, value: make_value(&mut rng) };
        db.add(&mut r).unwrap();
    }
    db
}

fn run_mixed(db: &Tqdb, read_fraction: f64) {
    let mut rng = rand::rng();
    for _ in 0..OPS_PER_RUN {
        let id = rng.random_range(1..=RECORD_COUNT);
        if rng.random_bool(read_fraction) {
            black_box(db.get::<Record>(id).ok());
        } else {
            let value = make_value(&mut rng);
            db.update::<Record>(id, &Record { id, value }).unwrap();
        }
    }
}

fn bench_load(c: &mut Criterion) {
    c.bench_function("load_10k", |b| {
        b.iter_batched(
            TempDir::new,
            |dir| black_box(load(dir.path())),
            BatchSize::LargeInput,
        )
    });
}

fn bench_workload_a(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = load(dir.path());
    c.bench_function("workload_a_50_50", |b| b.iter(|| run_mixed(&db, 0.5)));
}

fn bench_workload_b(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = load(dir.path());
    c.bench_function("workload_b_95_05", |b| b.iter(|| run_mixed(&db, 0.95)));
}

fn bench_workload_c(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = load(dir.path());
    c.bench_function("workload_c_read_only", |b| b.iter(|| run_mixed(&db, 1.0)));
}

criterion_group!(
    benches,
    bench_load,
    bench_workload_a,
    bench_workload_b,
    bench_workload_c,
);
criterion_main!(benches);
