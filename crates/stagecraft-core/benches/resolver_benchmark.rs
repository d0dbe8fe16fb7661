//! Agent Resolution Benchmarks
//!
//! Measures the hot path of dynamic agent selection:
//! - Task classification
//! - Full resolution against the built-in roster
//! - Stage condition evaluation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use std::sync::Arc;

use stagecraft_core::agents::{
    builtin_capabilities, AgentCapabilityRegistry, DynamicAgentResolver, TaskClassifier, TaskContext,
};
use stagecraft_core::config::ResolverConfig;
use stagecraft_core::pipeline::Condition;

fn resolver() -> DynamicAgentResolver {
    let registry = AgentCapabilityRegistry::from_capabilities(builtin_capabilities()).unwrap();
    DynamicAgentResolver::new(Arc::new(registry), ResolverConfig::default())
}

fn tasks() -> Vec<(&'static str, TaskContext)> {
    vec![
        (
            "infrastructure",
            TaskContext::new("Provision AWS infrastructure with Terraform and Kubernetes")
                .with_files(&["infra/main.tf", "deploy/k8s/service.yaml"]),
        ),
        (
            "frontend",
            TaskContext::new("Fix the React component rendering bug in the settings page")
                .with_files(&["src/components/Settings.tsx"])
                .with_dependencies(&["react", "react-dom"]),
        ),
        ("vague", TaskContext::new("Do something useful")),
    ]
}

/// Benchmark task classification alone
fn bench_classification(c: &mut Criterion) {
    let classifier = TaskClassifier::new();
    let mut group = c.benchmark_group("classification");

    for (name, task) in tasks() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &task, |b, task| {
            b.iter(|| black_box(classifier.classify(black_box(task))))
        });
    }

    group.finish();
}

/// Benchmark full resolution
fn bench_resolution(c: &mut Criterion) {
    let resolver = resolver();
    let mut group = c.benchmark_group("resolution");
    group.throughput(Throughput::Elements(resolver.registry().len() as u64));

    for (name, task) in tasks() {
        group.bench_with_input(BenchmarkId::new("resolve_agent", name), &task, |b, task| {
            b.iter(|| black_box(resolver.resolve_agent(black_box(task))))
        });
    }

    let all = tasks();
    let (_, task) = &all[0];
    group.bench_function("detailed_analysis", |b| {
        b.iter(|| black_box(resolver.get_detailed_analysis(black_box(task))))
    });

    group.finish();
}

/// Benchmark condition parsing and evaluation
fn bench_conditions(c: &mut Criterion) {
    let mut group = c.benchmark_group("conditions");
    let source = "review.score >= 0.8 && review.verdict =~ '^approved' || !input.strict";
    let values = json!({"review.score": 0.9, "review.verdict": "approved with notes", "input.strict": true});

    group.bench_function("parse", |b| {
        b.iter(|| black_box(Condition::parse(black_box(source)).unwrap()))
    });

    let condition = Condition::parse(source).unwrap();
    group.bench_function("evaluate", |b| {
        b.iter(|| black_box(condition.evaluate(|name| values.get(name).cloned().unwrap_or(Value::Null))))
    });

    group.finish();
}

criterion_group!(benches, bench_classification, bench_resolution, bench_conditions);
criterion_main!(benches);
