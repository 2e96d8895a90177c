use std::sync::Arc;
use std::thread;

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tessera_core::{IndexedTileArchive, TileCoord};

const TILES: u32 = 1024;
const TILE_BYTES: usize = 16 * 1024;

fn bench_archive_append(c: &mut Criterion) {
    let payload = vec![0x5Au8; TILE_BYTES];
    let mut group = c.benchmark_group("archive_append");
    group.throughput(Throughput::Bytes(u64::from(TILES) * TILE_BYTES as u64));

    group.bench_function("single_writer_16k", |b| {
        b.iter_batched(
            || tempfile::tempdir().expect("tempdir"),
            |dir| {
                let archive = IndexedTileArchive::create(dir.path().join("bench.tsra"))
                    .expect("create archive");
                for x in 0..TILES {
                    archive
                        .append(TileCoord::new(10, x, 0), black_box(&payload))
                        .expect("append");
                }
                archive.finalize().expect("finalize");
            },
            BatchSize::PerIteration,
        )
    });

    for writers in [4u32, 8] {
        group.bench_function(format!("{writers}_writers_16k"), |b| {
            b.iter_batched(
                || tempfile::tempdir().expect("tempdir"),
                |dir| {
                    let archive = Arc::new(
                        IndexedTileArchive::create(dir.path().join("bench.tsra"))
                            .expect("create archive"),
                    );
                    thread::scope(|scope| {
                        for writer in 0..writers {
                            let archive = &archive;
                            let payload = &payload;
                            scope.spawn(move || {
                                for x in (writer..TILES).step_by(writers as usize) {
                                    archive
                                        .append(TileCoord::new(10, x, 1), black_box(payload))
                                        .expect("append");
                                }
                            });
                        }
                    });
                    archive.finalize().expect("finalize");
                },
                BatchSize::PerIteration,
            )
        });
    }

    group.finish();
}

fn bench_index_lookup(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive =
        IndexedTileArchive::create(dir.path().join("lookup.tsra")).expect("create archive");
    for x in 0..TILES {
        archive
            .append(TileCoord::new(10, x, 2), b"tile")
            .expect("append");
    }

    c.bench_function("archive_contains_1k", |b| {
        b.iter(|| {
            (0..TILES)
                .filter(|x| archive.contains(black_box(&TileCoord::new(10, *x, 2))))
                .count()
        })
    });
}

criterion_group!(benches, bench_archive_append, bench_index_lookup);
criterion_main!(benches);
