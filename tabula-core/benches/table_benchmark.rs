use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::cell::RefCell;
use std::hint::black_box;
use std::rc::Rc;
use tabula_core::{DetachedRow, Table, UndoRedo};

const ROWS: usize = 1000;

fn detached_rows(table: &Table) -> Vec<DetachedRow> {
    let text = table.column_ids()[0];
    let number = table.column_ids()[1];
    (0..ROWS)
        .map(|i| {
            let mut row = table.create_detached_row();
            row.set_value(text, format!("row {i}")).set_value(number, i as f64);
            row
        })
        .collect()
}

fn bench_row_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("Row Insert");
    group.throughput(Throughput::Elements(ROWS as u64));

    group.bench_function("bulk_detached_insert", |b| {
        b.iter_batched(
            || {
                let table = Table::with_default_schema(0);
                let rows = detached_rows(&table);
                (table, rows)
            },
            |(mut table, rows)| {
                table.append_rows(black_box(rows)).unwrap();
                table
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("per_row_insert", |b| {
        b.iter_batched(
            || {
                let table = Table::with_default_schema(0);
                let rows = detached_rows(&table);
                (table, rows)
            },
            |(mut table, rows)| {
                for row in rows {
                    table.append_rows(vec![black_box(row)]).unwrap();
                }
                table
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_undo_bulk_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("Undo");
    group.throughput(Throughput::Elements(ROWS as u64));

    group.bench_function("undo_bulk_insert", |b| {
        b.iter_batched(
            || {
                let mut table = Table::with_default_schema(0);
                let undo = UndoRedo::new(&table);
                let rows = detached_rows(&table);
                table.append_rows(rows).unwrap();
                (table, undo)
            },
            |(mut table, undo)| {
                black_box(undo.undo(&mut table).unwrap());
                table
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_apply_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("Replication");
    group.throughput(Throughput::Elements(ROWS as u64));

    let mut source = Table::with_default_schema(0);
    let base = source.encode_state();
    let update = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&update);
    let _sub = source.on_commit(move |commit| {
        if let Some(bytes) = &commit.update {
            *sink.borrow_mut() = bytes.clone();
        }
    });
    let rows = detached_rows(&source);
    source.append_rows(rows).unwrap();
    let update = update.borrow().clone();

    group.bench_function("apply_bulk_update", |b| {
        b.iter_batched(
            || {
                let mut table = Table::new();
                table.load_state(&base).unwrap();
                table
            },
            |mut table| {
                table.apply_update(black_box(&update)).unwrap();
                table
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("encode_state", |b| {
        b.iter(|| black_box(source.encode_state()))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_row_insert,
    bench_undo_bulk_insert,
    bench_apply_update
);
criterion_main!(benches);
