//! Criterion benchmarks for understand-core.
//!
//! ## Benchmark groups
//!
//! 1. **extraction**: parse + function/call extraction of one Python file.
//! 2. **scan**: full scans of synthetic repositories, cold and memoized.
//! 3. **lens**: multi-source BFS over synthetic call graphs.
//! 4. **merge_tour**: trace merge, ranking and tour generation.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/understand-core/Cargo.toml
//! # Run only the lens group:
//! cargo bench --manifest-path crates/understand-core/Cargo.toml -- lens
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use understand_core::indexer::cache::ScanContext;
use understand_core::indexer::functions::extract_facts;
use understand_core::indexer::parser::parse_source;
use understand_core::indexer::pipeline::{scan, ScanOptions};
use understand_core::models::{
    CallTarget, FunctionRecord, RepositoryMap, Trace, LANGUAGE_PYTHON,
};
use understand_core::query::lens::from_seeds;
use understand_core::query::merge::{merge, rank};
use understand_core::query::tour::generate;
use understand_core::trace::recorder::{EventLog, RecordLimits};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const PYTHON_SOURCE: &str = r#"
import json
import logging
from pkg.store import Repository

log = logging.getLogger(__name__)


class OrderService:
    def __init__(self, repo):
        self.repo = repo

    def place(self, order):
        if not order.items:
            raise ValueError("empty order")
        total = self.total(order)
        for item in order.items:
            if item.qty <= 0 or item.price < 0:
                log.warning("bad item %s", item)
                continue
        self.repo.save(order)
        return total

    def total(self, order):
        return sum(i.qty * i.price for i in order.items if i.qty > 0)


def export(orders, path):
    with open(path, "w") as fh:
        json.dump([o.id for o in orders], fh)


def main():
    service = OrderService(Repository())
    try:
        service.place(load())
    except ValueError:
        log.exception("failed")
"#;

/// Write `files` modules of `functions` functions each, every function
/// calling the next one and one function of the next module.
fn write_repo(root: &Path, files: usize, functions: usize) {
    let pkg = root.join("pkg");
    fs::create_dir_all(&pkg).unwrap();
    fs::write(pkg.join("__init__.py"), "").unwrap();
    for f in 0..files {
        let next = (f + 1) % files;
        let mut source = format!("from pkg import mod_{next}\n\n");
        for i in 0..functions {
            source.push_str(&format!(
                "def fn_{f}_{i}(x):\n    if x > {i}:\n        return fn_{f}_{j}(x - 1)\n    return mod_{next}.fn_{next}_0(x)\n\n",
                j = (i + 1) % functions,
            ));
        }
        fs::write(pkg.join(format!("mod_{f}.py")), source).unwrap();
    }
}

/// Layered synthetic map: `width` functions per layer, each calling two
/// functions of the next layer.
fn layered_map(layers: usize, width: usize) -> RepositoryMap {
    let name = |l: usize, w: usize| format!("pkg/layer_{l}:f_{w}");
    let mut functions = BTreeMap::new();
    for l in 0..layers {
        for w in 0..width {
            let calls: BTreeSet<CallTarget> = if l + 1 < layers {
                [w, (w * 7 + 3) % width]
                    .into_iter()
                    .map(|t| CallTarget::Resolved(name(l + 1, t)))
                    .collect()
            } else {
                BTreeSet::new()
            };
            functions.insert(
                name(l, w),
                FunctionRecord {
                    file: format!("pkg/layer_{l}.py"),
                    line_start: (w * 3 + 1) as u32,
                    line_end: (w * 3 + 2) as u32,
                    calls,
                    complexity: 1,
                    side_effects: BTreeSet::new(),
                },
            );
        }
    }
    RepositoryMap::new(LANGUAGE_PYTHON, functions)
}

fn layered_trace(layers: usize) -> Trace {
    let mut log = EventLog::new(RecordLimits::unbounded());
    let path: Vec<String> = (0..layers).map(|l| format!("pkg/layer_{l}:f_0")).collect();
    for name in &path {
        let _ = log.call(name);
    }
    let _ = log.exception(&path[layers - 1]);
    for name in path.iter().rev() {
        let _ = log.ret(name);
    }
    log.finish()
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("extraction");
    group.bench_function("parse_and_extract/python", |b| {
        b.iter(|| {
            let unit = parse_source(black_box(PYTHON_SOURCE).to_string(), LANGUAGE_PYTHON)
                .ok()
                .unwrap();
            black_box(extract_facts(&unit, "pkg/orders.py"));
        });
    });
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    group.sample_size(20);

    for &files in &[10usize, 50] {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path(), files, 20);
        let options = ScanOptions::default();

        group.bench_with_input(BenchmarkId::new("cold", files), &files, |b, _| {
            b.iter(|| {
                let outcome = scan(dir.path(), &options, &ScanContext::new()).unwrap();
                black_box(outcome.map.len());
            });
        });

        let warm = ScanContext::new();
        scan(dir.path(), &options, &warm).unwrap();
        group.bench_with_input(BenchmarkId::new("memoized", files), &files, |b, _| {
            b.iter(|| {
                let outcome = scan(dir.path(), &options, &warm).unwrap();
                black_box(outcome.cache_hits);
            });
        });
    }

    group.finish();
}

fn bench_lens(c: &mut Criterion) {
    let mut group = c.benchmark_group("lens");
    for &width in &[50usize, 500] {
        let map = layered_map(8, width);
        let seeds = ["pkg/layer_0:f_0", "pkg/layer_4:f_1"];
        for hops in [2u32, 5] {
            group.bench_with_input(
                BenchmarkId::new(format!("from_seeds/hops_{hops}"), width),
                &width,
                |b, _| {
                    b.iter(|| black_box(from_seeds(&map, &seeds, hops).unwrap()));
                },
            );
        }
    }
    group.finish();
}

fn bench_merge_tour(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_tour");
    for &width in &[50usize, 500] {
        let map = layered_map(8, width);
        let lens = from_seeds(&map, &["pkg/layer_0:f_0"], 5).unwrap();
        let trace = layered_trace(8);

        group.bench_with_input(BenchmarkId::new("merge", width), &width, |b, _| {
            b.iter(|| black_box(merge(&lens, &trace)));
        });

        let merged = merge(&lens, &trace);
        group.bench_with_input(BenchmarkId::new("rank", width), &width, |b, _| {
            b.iter(|| black_box(rank(&merged).len()));
        });
        group.bench_with_input(BenchmarkId::new("generate", width), &width, |b, _| {
            b.iter(|| black_box(generate(&merged)));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Register all benchmark groups
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    bench_extraction,
    bench_scan,
    bench_lens,
    bench_merge_tour,
);
criterion_main!(benches);
