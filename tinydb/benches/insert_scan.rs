use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;
use tinydb::{ColumnDesc, ColumnType, Database, TableDesc, Value};

fn setup_db(rows: i64) -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let mut db = Database::open(dir.path().join("bench.db")).unwrap();
    db.create_table(TableDesc::new(
        "bench",
        vec![
            ColumnDesc::new("id", ColumnType::Integer).primary_key(),
            ColumnDesc::new("name", ColumnType::Text),
            ColumnDesc::new("value", ColumnType::Integer),
        ],
    ))
    .unwrap();

    db.begin().unwrap();
    for i in 0..rows {
        db.insert(
            "bench",
            vec![
                Value::Integer(i),
                Value::Text(format!("name{i}")),
                Value::Integer(i * 10),
            ],
        )
        .unwrap();
    }
    db.commit().unwrap();
    (dir, db)
}

fn benchmark_point_lookup(c: &mut Criterion) {
    let (_dir, mut db) = setup_db(10_000);
    c.bench_function("point_lookup", |b| {
        let mut i = 0i64;
        b.iter(|| {
            i = (i + 7919) % 10_000;
            let row = db.get("bench", black_box(&[Value::Integer(i)])).unwrap();
            black_box(row)
        })
    });
}

fn benchmark_full_scan(c: &mut Criterion) {
    let (_dir, mut db) = setup_db(10_000);
    c.bench_function("full_scan", |b| {
        b.iter(|| {
            let count = db
                .scan("bench", None, None, true)
                .unwrap()
                .filter(|r| r.is_ok())
                .count();
            black_box(count)
        })
    });
}

fn benchmark_batched_insert(c: &mut Criterion) {
    c.bench_function("insert_1000_rows", |b| {
        b.iter(|| {
            let (_dir, mut db) = setup_db(0);
            db.begin().unwrap();
            for i in 0..1000 {
                db.insert(
                    "bench",
                    vec![
                        Value::Integer(i),
                        Value::Text(format!("name{i}")),
                        Value::Integer(i * 10),
                    ],
                )
                .unwrap();
            }
            db.commit().unwrap();
        })
    });
}

criterion_group!(
    benches,
    benchmark_point_lookup,
    benchmark_full_scan,
    benchmark_batched_insert
);
criterion_main!(benches);
