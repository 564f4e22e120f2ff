use criterion::{criterion_group, criterion_main, Criterion};
use kmeans_mesh::{generate_points, run_clustering, MeshConfig, NumericMode};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn bench_mesh(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let points = generate_points(20_000, 8, &mut rng);
    let config = MeshConfig {
        n_points: 20_000,
        n_features: 8,
        n_clusters: 8,
        n_units: 8,
        n_lanes_per_unit: 4,
        convergence_threshold: 1e-4,
        max_iterations: 25,
        numeric_mode: NumericMode::Real,
        scratch_capacity_bytes: 16 * 1024,
    };
    let seed = |cluster: usize| points.row(cluster * 2_000).to_vec();

    c.bench_function("mesh_real_20k_8d", |b| {
        b.iter(|| {
            let _run = run_clustering(&config, &points, seed).expect("real bench run");
        });
    });

    let quantized_config = MeshConfig {
        numeric_mode: NumericMode::Quantized,
        ..config.clone()
    };

    c.bench_function("mesh_quantized_20k_8d", |b| {
        b.iter(|| {
            let _run =
                run_clustering(&quantized_config, &points, seed).expect("quantized bench run");
        });
    });
}

criterion_group!(benches, bench_mesh);
criterion_main!(benches);
