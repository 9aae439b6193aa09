use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hzz4l::{
    data::{Dataset, Event, Lepton},
    delivery::{Delivered, FileMetadata},
    histograms::Binning,
    processor::{run, HzzProcessor},
    Float,
};
use rayon::ThreadPoolBuilder;

/// Four-lepton events spread over the histogram range, no randomness needed.
fn synthetic_chunk(sample: &str, n_events: usize) -> Delivered {
    let events = (0..n_events)
        .map(|i| {
            let p = 20.0 + (i % 50) as Float;
            let eta = ((i % 7) as Float - 3.0) * 0.3;
            let flavor = if i % 3 == 0 { 11 } else { 13 };
            let lepton = |phi: Float, charge: i32, type_id: i32| {
                Lepton::new(p, eta, phi, p * eta.cosh(), charge, type_id)
            };
            Event::new(vec![
                lepton(0.0, 1, flavor),
                lepton(std::f64::consts::PI, -1, flavor),
                lepton(std::f64::consts::FRAC_PI_2, 1, 13),
                lepton(-std::f64::consts::FRAC_PI_2, -1, 13),
            ])
        })
        .collect();
    Delivered {
        metadata: FileMetadata::simulation(sample, format!("{sample}.parquet"), 1.0, 1e4, 1.0),
        dataset: Dataset::new(events),
        n_read: n_events,
    }
}

fn fill_benchmark(c: &mut Criterion) {
    let processor = HzzProcessor::new(Binning::default(), 10.0);
    let chunks: Vec<Delivered> = (0..16)
        .map(|i| synthetic_chunk(&format!("sample_{}", i % 4), 50_000))
        .collect();
    let mut group = c.benchmark_group("Histogram Fill Performance");
    let max_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let n_threads: Vec<usize> = (0..)
        .map(|x| 1 << x)
        .take_while(|&p| p <= max_threads)
        .collect();
    for threads in n_threads {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap();
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &_threads| b.iter(|| pool.install(|| black_box(run(&processor, &chunks).unwrap()))),
        );
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10)).sample_size(50);
    targets = fill_benchmark
}
criterion_main!(benches);
