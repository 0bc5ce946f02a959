// Copyright 2025 the Orthant Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use orthant_geometry::BoxND;
use orthant_tree::{Execution, OctreeBox, OctreePoint, TreeOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn gen_points(count: usize, extent: f64, seed: u64) -> Vec<[f64; 3]> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            [
                rng.gen_range(0.0..extent),
                rng.gen_range(0.0..extent),
                rng.gen_range(0.0..extent),
            ]
        })
        .collect()
}

fn gen_boxes(count: usize, extent: f64, size: f64, seed: u64) -> Vec<BoxND<3, f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let min = [
                rng.gen_range(0.0..extent),
                rng.gen_range(0.0..extent),
                rng.gen_range(0.0..extent),
            ];
            BoxND::new(
                min,
                [
                    min[0] + rng.gen_range(0.1..size),
                    min[1] + rng.gen_range(0.1..size),
                    min[2] + rng.gen_range(0.1..size),
                ],
            )
        })
        .collect()
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    for count in [1_000usize, 20_000] {
        let points = gen_points(count, 100.0, 1);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("points_serial_{count}"), |b| {
            b.iter(|| {
                OctreePoint::build(
                    black_box(&points),
                    TreeOptions {
                        max_entities_per_node: 20,
                        ..Default::default()
                    },
                )
            });
        });
        group.bench_function(format!("points_parallel_{count}"), |b| {
            b.iter(|| {
                OctreePoint::build(
                    black_box(&points),
                    TreeOptions {
                        max_entities_per_node: 20,
                        execution: Execution::Parallel,
                        ..Default::default()
                    },
                )
            });
        });

        let boxes = gen_boxes(count, 100.0, 2.0, 2);
        group.bench_function(format!("boxes_serial_{count}"), |b| {
            b.iter(|| OctreeBox::build(black_box(&boxes), TreeOptions::default()));
        });
    }
    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let points = gen_points(20_000, 100.0, 3);
    let point_tree = OctreePoint::build(&points, TreeOptions::default());
    let boxes = gen_boxes(20_000, 100.0, 1.5, 4);
    let box_tree = OctreeBox::build(&boxes, TreeOptions::default());

    let mut group = c.benchmark_group("queries");
    group.bench_function("range_search_points", |b| {
        let range = BoxND::new([20.0, 20.0, 20.0], [40.0, 40.0, 40.0]);
        b.iter(|| point_tree.range_search(black_box(&range), &points));
    });
    group.bench_function("knn_10", |b| {
        b.iter(|| point_tree.nearest_neighbors(black_box(&[50.0, 50.0, 50.0]), 10, &points));
    });
    group.bench_function("pick_search", |b| {
        b.iter(|| box_tree.pick_search(black_box(&[33.0, 66.0, 11.0]), &boxes));
    });
    group.bench_function("ray_first", |b| {
        b.iter(|| {
            box_tree.ray_intersected_first(
                black_box(&[0.0, 50.0, 50.0]),
                &[1.0, 0.0, 0.0],
                &boxes,
                0.0,
            )
        });
    });
    group.finish();
}

fn bench_collision(c: &mut Criterion) {
    let boxes = gen_boxes(10_000, 100.0, 1.0, 5);
    let tree = OctreeBox::build(&boxes, TreeOptions::default());

    let mut group = c.benchmark_group("collision");
    group.sample_size(20);
    group.bench_function("self_serial", |b| {
        b.iter(|| tree.collision_detection(black_box(&boxes)));
    });
    group.bench_function("self_parallel", |b| {
        b.iter(|| tree.collision_detection_parallel(black_box(&boxes)));
    });
    group.finish();
}

fn bench_edit(c: &mut Criterion) {
    let points = gen_points(10_000, 100.0, 6);
    let mut group = c.benchmark_group("edit");
    group.bench_function("insert_with_rebalancing", |b| {
        b.iter_batched(
            || OctreePoint::build(&points[..9_000], TreeOptions::default()),
            |mut tree| {
                for (id, point) in points.iter().enumerate().skip(9_000) {
                    tree.insert_with_rebalancing(id, point, &points);
                }
                tree
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_build, bench_queries, bench_collision, bench_edit);
criterion_main!(benches);
