use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::{Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use posemap_core::peaks::{find_peaks, MapLayout};
use posemap_core::transform::{warp_channels, Affine2x3};

fn random_stack(rng: &mut StdRng, c: usize, h: usize, w: usize) -> Array3<f32> {
    Array3::from_shape_fn((c, h, w), |_| rng.random_range(0.0..1.0))
}

fn random_maps(rng: &mut StdRng, n: usize, c: usize, h: usize, w: usize) -> Array4<f32> {
    Array4::from_shape_fn((n, c, h, w), |_| rng.random_range(0.0..1.0))
}

fn bench_warp(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let stack = random_stack(&mut rng, 3, 192, 192);
    let m = Affine2x3::rotation_about((96.0, 96.0), 15.0, 1.05);

    c.bench_function("warp_channels_3x192x192", |b| {
        b.iter(|| warp_channels(black_box(stack.view()), black_box(&m)).unwrap())
    });
}

fn bench_find_peaks(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0xBEEF);
    let maps = random_maps(&mut rng, 32, 32, 192, 192);

    c.bench_function("find_peaks_32x32x192x192", |b| {
        b.iter(|| find_peaks(black_box(maps.view()), MapLayout::ChannelsFirst).unwrap())
    });
}

criterion_group!(benches, bench_warp, bench_find_peaks);
criterion_main!(benches);
