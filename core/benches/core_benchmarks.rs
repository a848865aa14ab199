use criterion::{Criterion, black_box, criterion_group, criterion_main};

use orrery_core::math::{Pose, Vec3, quat_from_rotation_y, quat_from_rotation_z, quat_rotate_vec3};

// ---------------------------------------------------------------------------
// Pose composition
// ---------------------------------------------------------------------------

fn chain(depth: usize) -> Vec<Pose> {
    (0..depth)
        .map(|i| {
            Pose::new(
                Vec3::new(1.0, i as f32 * 0.5, 0.0),
                quat_from_rotation_y(0.1 * i as f32),
            )
        })
        .collect()
}

fn bench_compose_chain_16(c: &mut Criterion) {
    let poses = chain(16);
    c.bench_function("compose_pose_chain_16", |b| {
        b.iter(|| {
            poses
                .iter()
                .fold(Pose::identity(), |world, local| world.compose(black_box(local)))
        });
    });
}

fn bench_compose_chain_256(c: &mut Criterion) {
    let poses = chain(256);
    c.bench_function("compose_pose_chain_256", |b| {
        b.iter(|| {
            poses
                .iter()
                .fold(Pose::identity(), |world, local| world.compose(black_box(local)))
        });
    });
}

fn bench_rotate_vec3_10k(c: &mut Criterion) {
    let rotation = quat_from_rotation_z(0.75);
    c.bench_function("rotate_vec3_10k", |b| {
        b.iter(|| {
            let mut sum = Vec3::zeros();
            for i in 0..10_000 {
                sum += quat_rotate_vec3(rotation, black_box(Vec3::new(i as f32, 1.0, 0.0)));
            }
            sum
        });
    });
}

criterion_group!(
    benches,
    bench_compose_chain_16,
    bench_compose_chain_256,
    bench_rotate_vec3_10k,
);
criterion_main!(benches);
