//! Benchmark the rule dependency graph's topological ordering at a range of
//! fan-out sizes, since it runs once per session creation on the hot path.

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sxn_core::rules::graph::topological_order;
use sxn_core::rules::types::{RuleConfig, RuleDefinition};

fn chain(n: usize) -> BTreeMap<String, RuleDefinition> {
    let mut rules = BTreeMap::new();
    for i in 0..n {
        let name = format!("rule-{i}");
        let dependencies = if i == 0 { Vec::new() } else { vec![format!("rule-{}", i - 1)] };
        rules.insert(
            name.clone(),
            RuleDefinition {
                name,
                config: RuleConfig::CopyFiles { files: vec![] },
                dependencies,
            },
        );
    }
    rules
}

fn fan_out(n: usize) -> BTreeMap<String, RuleDefinition> {
    let mut rules = BTreeMap::new();
    rules.insert(
        "root".to_string(),
        RuleDefinition {
            name: "root".to_string(),
            config: RuleConfig::CopyFiles { files: vec![] },
            dependencies: Vec::new(),
        },
    );
    for i in 0..n {
        let name = format!("leaf-{i}");
        rules.insert(
            name.clone(),
            RuleDefinition {
                name,
                config: RuleConfig::CopyFiles { files: vec![] },
                dependencies: vec!["root".to_string()],
            },
        );
    }
    rules
}

fn bench_scheduler(c: &mut Criterion) {
    let mut group = c.benchmark_group("topological_order");
    for size in [8, 64, 256] {
        let chained = chain(size);
        group.bench_with_input(BenchmarkId::new("chain", size), &chained, |b, rules| {
            b.iter(|| topological_order(black_box(rules)));
        });

        let fanned = fan_out(size);
        group.bench_with_input(BenchmarkId::new("fan_out", size), &fanned, |b, rules| {
            b.iter(|| topological_order(black_box(rules)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_scheduler);
criterion_main!(benches);
