use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lmql_runtime::{
    backend::ModelBackend,
    constraint::{build_mask, digest, parse_expr, OpContext, OpGraph},
    query::{HoleScope, ProgramState},
    tokenset::{Materialiser, TokenSet, TokenSetCache},
    RandomBackend, Tokenizer,
};

fn compute_mask(
    graph: &OpGraph,
    value: &str,
    tokens: &[String],
    tokenizer: &dyn Tokenizer,
    cache: &TokenSetCache,
) -> usize {
    let base = ProgramState::new();
    let scope = HoleScope::new(&base, "OUT", value, tokens);
    let ctx = OpContext {
        scope: &scope,
        active: Some("OUT"),
        cache,
        eos_token_id: tokenizer.eos_token_id(),
    };
    let digest = digest(graph, &ctx, true).unwrap();
    let materialiser = Materialiser::new(tokenizer, cache);
    build_mask(
        digest.follow.as_ref().unwrap(),
        &materialiser,
        &[],
        &TokenSet::empty(),
    )
    .count()
}

fn criterion_benchmark(c: &mut Criterion) {
    let tokenizer: Arc<dyn Tokenizer> = RandomBackend::new(123).unwrap().tokenizer();
    let constraints = [
        ("equality", r#"OUT == "Hello you" or OUT == "Hello There""#, "Hello "),
        ("token_length", "len(TOKENS(OUT)) < 10 and len(OUT) < 40", "Hello wor"),
        ("regex", r#"REGEX(OUT, "[0-9]{1,3}(,[0-9]+)?")"#, "12"),
        ("stops_at", r#"stops_at(OUT, ".") and len(TOKENS(OUT)) < 20"#, "Hello"),
    ];
    for (name, constraint, value) in constraints {
        let graph = OpGraph::compile(&parse_expr(constraint).unwrap()).unwrap();
        let tokens: Vec<String> = value.chars().map(|c| c.to_string()).collect();
        c.bench_function(&format!("mask/{}/cold", name), |b| {
            b.iter(|| {
                let cache = TokenSetCache::new();
                compute_mask(
                    black_box(&graph),
                    black_box(value),
                    &tokens,
                    tokenizer.as_ref(),
                    &cache,
                )
            })
        });
        let cache = TokenSetCache::new();
        c.bench_function(&format!("mask/{}/warm", name), |b| {
            b.iter(|| {
                compute_mask(
                    black_box(&graph),
                    black_box(value),
                    &tokens,
                    tokenizer.as_ref(),
                    &cache,
                )
            })
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
