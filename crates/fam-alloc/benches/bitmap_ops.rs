//! Benchmark: first-fit allocation and log replay.
//!
//! Measures the linear first-fit scan on a fragmented bitmap and the cost of
//! rebuilding a bitmap from a log full of single-extent files.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fam_alloc::{AllocBitmap, alloc_contiguous, build_bitmap};
use fam_ondisk::{EntryAttrs, Extent, FileCreation, LogEntry, LogHeader, LogView, SimpleExtent};
use fam_types::{FAMFS_ALLOC_UNIT, FAMFS_LOG_ENTRY_SIZE, FAMFS_LOG_HEADER_SIZE, FAMFS_LOG_LEN, GIB};

/// 1 TiB worth of units, roughly 5% free in small scattered holes.
fn fragmented_bitmap() -> AllocBitmap {
    let nbits = 1024 * GIB / FAMFS_ALLOC_UNIT;
    let mut bm = AllocBitmap::new(nbits);
    bm.set_range(0, nbits);
    let mut pos = 100_u64;
    while pos + 4 < nbits {
        bm.clear_range(pos, pos + 4);
        pos += 80;
    }
    bm
}

fn bench_first_fit(c: &mut Criterion) {
    let base = fragmented_bitmap();
    let mut group = c.benchmark_group("first_fit");

    group.bench_function("small_hole", |b| {
        b.iter_batched(
            || base.clone(),
            |mut bm| black_box(alloc_contiguous(&mut bm, black_box(FAMFS_ALLOC_UNIT))),
            criterion::BatchSize::LargeInput,
        );
    });

    group.bench_function("no_fit", |b| {
        b.iter_batched(
            || base.clone(),
            |mut bm| black_box(alloc_contiguous(&mut bm, black_box(64 * FAMFS_ALLOC_UNIT))),
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn full_log() -> Vec<u8> {
    let len = usize::try_from(FAMFS_LOG_LEN).expect("log len");
    let mut log = vec![0_u8; len];
    let mut hdr = LogHeader::new(FAMFS_LOG_LEN).expect("header");
    for i in 0..hdr.capacity() {
        let entry = LogEntry {
            seqnum: i,
            kind: fam_ondisk::LogEntryKind::File(FileCreation {
                relpath: format!("dir/file{i}"),
                size: FAMFS_ALLOC_UNIT,
                flags: 0,
                attrs: EntryAttrs::default(),
                extents: vec![Extent::Simple(SimpleExtent::new(
                    (i + 5) * FAMFS_ALLOC_UNIT,
                    FAMFS_ALLOC_UNIT,
                ))],
            }),
        };
        let at = FAMFS_LOG_HEADER_SIZE + usize::try_from(i).expect("index") * FAMFS_LOG_ENTRY_SIZE;
        log[at..at + FAMFS_LOG_ENTRY_SIZE].copy_from_slice(&entry.encode().expect("encode"));
        hdr.next_index += 1;
        hdr.next_seqnum += 1;
    }
    log[..FAMFS_LOG_HEADER_SIZE].copy_from_slice(&hdr.encode().expect("header"));
    log
}

fn bench_replay(c: &mut Criterion) {
    let log = full_log();
    let view = LogView::new(&log).expect("view");
    c.bench_function("replay_full_log", |b| {
        b.iter(|| black_box(build_bitmap(black_box(&view), 64 * GIB, false)));
    });
}

criterion_group!(benches, bench_first_fit, bench_replay);
criterion_main!(benches);
