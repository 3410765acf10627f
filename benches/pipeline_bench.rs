//! Benchmarks for extract-pipeline
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::path::Path;

fn benchmark_path_filter(c: &mut Criterion) {
    use extract_pipeline::discovery::PathFilter;

    let filter = PathFilter::new(
        &["*.txt".to_string(), "docs/**/*.md".to_string()],
        &["**/target/**".to_string(), "*.tmp".to_string()],
    )
    .unwrap();

    c.bench_function("path_filter_accepts", |b| {
        let paths = [
            ("/data/docs/guide/intro.md", "docs/guide/intro.md"),
            ("/data/notes.txt", "notes.txt"),
            ("/data/build/target/out.txt", "build/target/out.txt"),
            ("/data/.DS_Store", ".DS_Store"),
            ("/data/scratch.tmp", "scratch.tmp"),
        ];

        b.iter(|| {
            for (path, relative) in &paths {
                black_box(filter.accepts(Path::new(path), relative));
            }
        })
    });
}

fn benchmark_memory_queue(c: &mut Criterion) {
    use extract_pipeline::codec::DocumentCodec;
    use extract_pipeline::queue::{BlockingQueue, MemoryQueue};
    use extract_pipeline::WorkItem;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    c.bench_function("memory_queue_add_poll", |b| {
        let queue: MemoryQueue<WorkItem, _> = MemoryQueue::new("bench", DocumentCodec);
        let item = WorkItem::new("/data/docs/report.txt");

        b.iter(|| {
            runtime.block_on(async {
                queue.add(&item).await.unwrap();
                black_box(queue.poll().await.unwrap());
            })
        })
    });
}

criterion_group!(benches, benchmark_path_filter, benchmark_memory_queue);
criterion_main!(benches);
