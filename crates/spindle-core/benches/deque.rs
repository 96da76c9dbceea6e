use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spindle::scheduler::{Steal, Worker};
use spindle::sync::WaitQueue;
use spindle::{Runtime, RuntimeConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("deque_owner");

    for batch in [16usize, 256, 4096] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("push_pop_bottom", batch), &batch, |b, &batch| {
            let worker = Worker::<usize>::new();
            b.iter(|| {
                for i in 0..batch {
                    worker.push_bottom(black_box(i));
                }
                while let Some(item) = worker.pop_bottom() {
                    black_box(item);
                }
            });
        });
    }

    group.finish();
}

fn bench_steal(c: &mut Criterion) {
    let mut group = c.benchmark_group("deque_steal");
    const BATCH: usize = 1024;
    group.throughput(Throughput::Elements(BATCH as u64));

    group.bench_function("pop_top_uncontended", |b| {
        let worker = Worker::<usize>::new();
        let stealer = worker.stealer();
        b.iter(|| {
            for i in 0..BATCH {
                worker.push_bottom(i);
            }
            while let Steal::Success(item) = stealer.pop_top() {
                black_box(item);
            }
        });
    });

    group.bench_function("push_with_thief", |b| {
        let worker = Worker::<usize>::new();
        let stealer = worker.stealer();
        let done = Arc::new(AtomicBool::new(false));
        let thief = {
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    black_box(stealer.pop_top());
                }
            })
        };

        b.iter(|| {
            for i in 0..BATCH {
                worker.push_bottom(i);
            }
            while let Some(item) = worker.pop_bottom() {
                black_box(item);
            }
        });

        done.store(true, Ordering::Relaxed);
        let _ = thief.join();
    });

    group.finish();
}

fn bench_wait_queue(c: &mut Criterion) {
    c.bench_function("wait_queue_enqueue_dequeue", |b| {
        let queue = WaitQueue::<usize>::new();
        b.iter(|| {
            for i in 0..256 {
                queue.enqueue(black_box(i));
            }
            while let Some(item) = queue.dequeue() {
                black_box(item);
            }
        });
    });
}

fn bench_spawn_yield(c: &mut Criterion) {
    let mut group = c.benchmark_group("runtime");
    group.sample_size(20);

    for fibers in [100usize, 1000] {
        group.bench_with_input(BenchmarkId::new("spawn_and_yield", fibers), &fibers, |b, &fibers| {
            b.iter(|| {
                let runtime = Runtime::new(RuntimeConfig::current_thread());
                let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(fibers));
                for _ in 0..fibers {
                    let remaining = remaining.clone();
                    runtime.spawn(move || {
                        let _ = spindle::yield_now();
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            if let Ok(handle) = spindle::handle() {
                                handle.stop();
                            }
                        }
                    });
                }
                runtime.run().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_push_pop, bench_steal, bench_wait_queue, bench_spawn_yield);
criterion_main!(benches);
