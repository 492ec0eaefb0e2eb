use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ufsck::config::{CheckConfig, RunMode};
use ufsck::confirm::AlwaysYes;
use ufsck::engine::Engine;
use ufsck::format::ROOTINO;
use ufsck::image::{Image, ImageBuilder};

fn populated() -> Image {
    let mut builder = ImageBuilder::new();
    let mut parent = ROOTINO;
    for d in 0..4 {
        let dir = builder.add_dir(parent, &format!("d{}", d)).unwrap();
        for f in 0..6 {
            builder
                .add_file(dir, &format!("f{}", f), 700 + 1500 * f as u64)
                .unwrap();
        }
        parent = dir;
    }
    builder.build().unwrap()
}

fn benchmark_full_check(c: &mut Criterion) {
    let image = populated();

    c.bench_function("full_check_read_only", |b| {
        b.iter(|| {
            let engine = Engine::new(CheckConfig::with_mode(RunMode::ReadOnly));
            black_box(engine.run_device(Box::new(image.device().clone()), "bench"))
        });
    });

    c.bench_function("full_check_preen", |b| {
        b.iter(|| {
            let engine = Engine::new(CheckConfig::with_mode(RunMode::Preen))
                .with_confirm(Box::new(AlwaysYes));
            black_box(engine.run_device(Box::new(image.device().clone()), "bench"))
        });
    });
}

criterion_group!(benches, benchmark_full_check);
criterion_main!(benches);
