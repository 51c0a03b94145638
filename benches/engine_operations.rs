use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use mashtun::graph::DependencyGraph;
use mashtun::resolve::{Request, resolve};
use mashtun::{Formula, FormulaIndex, PlatformFingerprint};

fn platform() -> PlatformFingerprint {
    PlatformFingerprint {
        os: "linux".to_string(),
        arch: "x86_64".to_string(),
        os_series: "linux".to_string(),
        toolchain: "gcc".to_string(),
        toolchain_version: 13,
    }
}

/// Synthetic repository: a layered DAG where package i depends on up to
/// `fanout` packages in the layer below it.
fn synthetic_index(count: usize, fanout: usize) -> FormulaIndex {
    let formulae: Vec<Formula> = (0..count)
        .map(|i| {
            let deps: Vec<serde_json::Value> = (1..=fanout)
                .filter_map(|j| i.checked_sub(j))
                .map(|d| serde_json::json!({"name": format!("pkg{d}")}))
                .collect();
            serde_json::from_value(serde_json::json!({
                "name": format!("pkg{i}"),
                "version": "1.0.0",
                "dependencies": deps,
            }))
            .unwrap()
        })
        .collect();
    FormulaIndex::build(formulae).unwrap()
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_closure");
    let platform = platform();

    for count in [50usize, 200, 500] {
        let index = synthetic_index(count, 3);
        let root = format!("pkg{}", count - 1);
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let requests = [Request::new(black_box(root.as_str()))];
                resolve(&index, &platform, &requests).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_topo_order(c: &mut Criterion) {
    let platform = platform();
    let index = synthetic_index(500, 3);
    let resolution = resolve(&index, &platform, &[Request::new("pkg499")]).unwrap();
    let graph = DependencyGraph::build(&index, &platform, &resolution).unwrap();

    c.bench_function("topo_order 500 nodes", |b| {
        b.iter(|| black_box(&graph).topo_order().unwrap())
    });
}

criterion_group!(benches, bench_resolve, bench_topo_order);
criterion_main!(benches);
