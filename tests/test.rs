#[cfg(test)]

mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use insta::assert_snapshot;
    use lmql_runtime::{
        backend::ModelBackend,
        config::{CacheConfig, Config},
        constraint::{
            build_mask, digest, parse_expr, FollowMap, FollowValue, Mono, OpContext, OpGraph,
            Tagged, Value,
        },
        decoding::Backtracker,
        output::{StreamChunk, StreamSink},
        query::{Decorator, DecoratorContext, HoleScope, ProgramState},
        regex::{DerivativeCache, Regex},
        tokenset::{Comparison, Materialiser, Measure, TokenPredicate, TokenSet, TokenSetCache},
        EvalError, QueryOutcome, QueryResult, RandomBackend, Runtime, RuntimeError, Tokenizer,
    };

    fn config() -> Config {
        Config {
            cache: CacheConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn tokenizer() -> Arc<dyn Tokenizer> {
        RandomBackend::new(123).unwrap().tokenizer()
    }

    async fn try_run(source: &str) -> Result<QueryOutcome, RuntimeError> {
        Runtime::new(config()).run_source(source, vec![]).await
    }

    async fn run(source: &str) -> QueryResult {
        match try_run(source).await.unwrap() {
            QueryOutcome::Completed(results) => results.into_iter().next().unwrap(),
            QueryOutcome::Cancelled => panic!("the run was cancelled"),
        }
    }

    fn text(result: &QueryResult, name: &str) -> String {
        result.text(name).unwrap().to_string()
    }

    #[tokio::test]
    async fn hello_world() {
        let result = run(r#"
argmax
    "Hello[WHO]"
from "random(seed=123)"
where
    len(tokens(WHO)) < 10
"#)
        .await;
        let who = text(&result, "WHO");
        assert!(!who.is_empty());
        assert!(tokenizer().tokenize(&who).len() < 10);
        assert!(result.prompt.starts_with("Hello"));
        assert_eq!(result.prompt, format!("Hello{}", who));
    }

    #[tokio::test]
    async fn equality_forces_the_value() {
        let result = run(r#"
argmax
    "Q: Hi. A:[OUT]"
from "random(seed=123)"
where
    OUT == "Hello you"
"#)
        .await;
        assert_eq!(text(&result, "OUT"), "Hello you");
        assert!(result.prompt.ends_with("Hello you"));
        assert_eq!(result.prompt, "Q: Hi. A:Hello you");
    }

    #[tokio::test]
    async fn disjunction_picks_one_branch() {
        let result = run(r#"
argmax
    "Q: Hi. A:[OUT]"
from "random(seed=123)"
where
    OUT == "Hello you" or OUT == "Hello There"
"#)
        .await;
        let out = text(&result, "OUT");
        assert!(out == "Hello you" || out == "Hello There", "{:?}", out);
    }

    #[tokio::test]
    async fn token_length_equality() {
        let result = run(r#"
argmax
    "Q: Hi. A:[OUT]"
from "random(seed=123)"
where
    len(TOKENS(OUT)) == 2
"#)
        .await;
        let out = text(&result, "OUT");
        assert_eq!(tokenizer().tokenize(&out).len(), 2, "{:?}", out);
    }

    #[tokio::test]
    async fn character_length_equality() {
        let result = run(r#"
argmax
    "Q: Hi. A:[OUT]"
from "random(seed=123)"
where
    len(OUT) == 2
"#)
        .await;
        assert_eq!(text(&result, "OUT").len(), 2);
    }

    #[tokio::test]
    async fn stops_before_with_exact_token_length() {
        let result = run(r#"
argmax
    "A poem:\n"
    for i in range(5):
        "[NAME]'s line: [RHYME]\n"
from "random(seed=123)"
where
    stops_before(NAME, "'") and len(TOKENS(NAME)) < 6 and len(TOKENS(RHYME)) == 4
"#)
        .await;
        let tokenizer = tokenizer();
        assert!(!text(&result, "NAME").contains('\''));
        assert_eq!(tokenizer.tokenize(&text(&result, "RHYME")).len(), 4);
        let body = result.prompt.strip_prefix("A poem:\n").unwrap();
        let segments: Vec<&str> = body.split("'s line: ").collect();
        assert_eq!(segments.len(), 6, "{:?}", body);
        assert!(!segments[0].contains('\''));
        for segment in &segments[1..] {
            let rhyme = &segment[..4];
            assert_eq!(tokenizer.tokenize(rhyme).len(), 4, "{:?}", rhyme);
            assert!(segment[4..].starts_with('\n'));
            assert!(!segment[5..].contains('\''));
        }
    }

    #[tokio::test]
    async fn argmax_is_deterministic() {
        let source = r#"
argmax
    "Tell me a story:[STORY]"
from "random(seed=123)"
where
    len(TOKENS(STORY)) < 12
"#;
        let a = run(source).await;
        let b = run(source).await;
        assert_eq!(a.token_ids, b.token_ids);
        assert_eq!(a.prompt, b.prompt);
        assert_eq!(a.logprob, b.logprob);
    }

    #[tokio::test]
    async fn int_annotation_constrains_to_digits() {
        let result = run(r#"
argmax
    "Pick a number:[N: int; max_tokens=4]"
from "random(seed=123)"
"#)
        .await;
        let n = text(&result, "N");
        let digits = n.trim_start_matches(' ').trim_start_matches('-');
        assert!(!digits.is_empty(), "{:?}", n);
        assert!(digits.chars().all(|c| c.is_ascii_digit()), "{:?}", n);
    }

    #[tokio::test]
    async fn variables_flow_into_later_text() {
        let result = run(r#"
argmax
    "Name:[NAME]"
    GREETING = "Hi" + NAME
    if NAME == " Bob":
        "{GREETING}!"
    else:
        "{GREETING}?"
    return GREETING
from "random(seed=123)"
where
    NAME == " Bob"
"#)
        .await;
        assert_eq!(result.prompt, "Name: BobHi Bob!");
        assert_eq!(result.return_value, Value::Str("Hi Bob".to_string()));
    }

    #[tokio::test]
    async fn decorators_rewrite_and_fix_values() {
        let result = run(r#"
argmax
    'Say:[@upper OUT] and [@fixed("later") NEXT].'
from "random(seed=123)"
where
    OUT == " hi"
"#)
        .await;
        assert_eq!(text(&result, "OUT"), " HI");
        assert_eq!(text(&result, "NEXT"), "later");
        assert_eq!(result.prompt, "Say: HI and later.");
    }

    #[tokio::test]
    async fn nested_query_on_the_same_model() {
        let result = run(r#"
query main():
    'Say:[G: greet("Bob")] done'
    from "random(seed=123)"
query greet(name):
    "Hi {name}:[REPLY]"
    return REPLY
    where
        REPLY == " ok"
"#)
        .await;
        assert_eq!(text(&result, "G"), " ok");
        assert_eq!(result.prompt, "Say:Hi Bob: ok done");
    }

    #[tokio::test]
    async fn nested_query_on_another_model() {
        let result = run(r#"
query main():
    'Say:[G: greet("Bob")] done'
    from "random(seed=123)"
query greet(name):
    "Hi {name}:[REPLY]"
    return REPLY
    from "random(seed=7)"
    where
        REPLY == " ok"
"#)
        .await;
        assert_eq!(text(&result, "G"), " ok");
        assert_eq!(result.prompt, "Say:Hi Bob: ok done");
    }

    #[tokio::test]
    async fn sampling_keeps_every_branch_inside_the_constraint() {
        let outcome = try_run(r#"
sample(n=2, temperature=0.8)
    "Q: Hi. A:[OUT]"
from "random(seed=123)"
where
    OUT == "Hello you" or OUT == "Hello There"
"#)
        .await
        .unwrap();
        let QueryOutcome::Completed(results) = outcome else {
            panic!("the run was cancelled");
        };
        assert!(!results.is_empty());
        for result in results {
            let out = text(&result, "OUT");
            assert!(out == "Hello you" || out == "Hello There", "{:?}", out);
        }
    }

    #[tokio::test]
    async fn unsatisfiable_constraints_fail_in_finite_time() {
        let outcome = tokio::time::timeout(
            Duration::from_secs(30),
            try_run(r#"
argmax
    "Q:[OUT]"
from "random(seed=123)"
where
    OUT == "ab" and OUT == "cd"
"#),
        )
        .await
        .unwrap();
        assert!(
            matches!(
                outcome,
                Err(RuntimeError::ConstraintUnsatisfiable { .. } | RuntimeError::GenerationStuck { .. })
            ),
            "{:?}",
            outcome
        );
    }

    #[tokio::test]
    async fn undefined_variables_are_name_errors() {
        let outcome = try_run(r#"
argmax
    "Hello[WHO]"
where
    len(OTHER) < 3
"#)
        .await;
        let error = outcome.unwrap_err();
        assert!(error.to_string().contains("NameError"), "{}", error);
    }

    #[tokio::test]
    async fn unknown_models_are_reported() {
        let outcome = try_run(r#"
argmax
    "Hello[WHO]"
from "nonexistent-model"
"#)
        .await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn cancelled_runs_yield_cancelled() {
        let runtime = Runtime::new(config());
        runtime.cancellation_token().cancel();
        let outcome = runtime
            .run_source(
                r#"
argmax
    "Hello[WHO]"
from "random(seed=123)"
"#,
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(outcome, QueryOutcome::Cancelled);
    }

    #[tokio::test]
    async fn the_generation_deadline_is_enforced() {
        let mut config = config();
        config.backend.generation_timeout = Some(Duration::ZERO);
        let outcome = Runtime::new(config)
            .run_source(
                r#"
argmax
    "Hello[WHO]"
from "random(seed=123)"
"#,
                vec![],
            )
            .await;
        assert!(matches!(outcome, Err(RuntimeError::Timeout { .. })), "{:?}", outcome);
    }

    #[derive(Default)]
    struct Collect {
        chunks: Mutex<Vec<StreamChunk>>,
        done: Mutex<bool>,
    }

    impl StreamSink for Collect {
        fn chunk(&self, chunk: &StreamChunk) {
            self.chunks.lock().unwrap().push(chunk.clone());
        }

        fn done(&self) {
            *self.done.lock().unwrap() = true;
        }
    }

    #[tokio::test]
    async fn streaming_reports_growing_prefixes() {
        let sink = Arc::new(Collect::default());
        let mut runtime = Runtime::new(config());
        runtime.set_sink(sink.clone());
        let outcome = runtime
            .run_source(
                r#"
argmax
    "Q: Hi. A:[OUT]"
from "random(seed=123)"
where
    OUT == "Hello you"
"#,
                vec![],
            )
            .await
            .unwrap();
        assert!(outcome.best().is_some());
        assert!(*sink.done.lock().unwrap());
        let chunks = sink.chunks.lock().unwrap();
        assert!(!chunks.is_empty());
        for chunk in chunks.iter() {
            assert!(
                "Q: Hi. A:Hello you".starts_with(&chunk.prompt),
                "{:?}",
                chunk.prompt
            );
        }
    }

    async fn completed(source: &str) -> Vec<QueryResult> {
        match try_run(source).await.unwrap() {
            QueryOutcome::Completed(results) => results,
            QueryOutcome::Cancelled => panic!("the run was cancelled"),
        }
    }

    #[tokio::test]
    async fn beam_search_keeps_every_beam_inside_the_constraint() {
        let results = completed(r#"
beam(n=2)
    "Q: Hi. A:[OUT]"
from "random(seed=123)"
where
    OUT == "Hello you" or OUT == "Hello There"
"#)
        .await;
        assert!(!results.is_empty());
        for result in &results {
            let out = text(result, "OUT");
            assert!(out == "Hello you" || out == "Hello There", "{:?}", out);
            assert_eq!(result.prompt, format!("Q: Hi. A:{}", out));
        }
    }

    #[tokio::test]
    async fn beam_var_synchronises_at_hole_boundaries() {
        let results = completed(r#"
beam_var(n=2)
    "A:[FIRST] B:[SECOND]"
from "random(seed=123)"
where
    (FIRST == " yes" or FIRST == " no") and len(TOKENS(SECOND)) == 2
"#)
        .await;
        assert!(!results.is_empty());
        for result in &results {
            let first = text(result, "FIRST");
            assert!(first == " yes" || first == " no", "{:?}", first);
            assert_eq!(tokenizer().tokenize(&text(result, "SECOND")).len(), 2);
        }
    }

    #[tokio::test]
    async fn stops_at_ends_the_hole_on_the_phrase() {
        let result = run(r#"
argmax
    "Q:[OUT] Next"
from "random(seed=123)"
where
    stops_at(OUT, ".") and starts_with(OUT, "Ok.")
"#)
        .await;
        assert_eq!(text(&result, "OUT"), "Ok.");
        assert_eq!(result.prompt, "Q:Ok. Next");
    }

    #[tokio::test]
    async fn substring_membership_is_satisfiable() {
        let result = run(r#"
argmax
    "Q:[OUT]"
from "random(seed=123)"
where
    OUT in "Hello world" and len(TOKENS(OUT)) < 6
"#)
        .await;
        let out = text(&result, "OUT");
        assert!(!out.is_empty());
        assert!("Hello world".contains(out.as_str()), "{:?}", out);
    }

    #[tokio::test]
    async fn rewrites_that_move_a_stop_phrase_are_tokenization_mismatches() {
        let outcome = try_run(r#"
argmax
    "Say:[@upper OUT]B done"
from "random(seed=123)"
where
    OUT == " a" and stops_at(OUT, "AB")
"#)
        .await;
        assert!(
            matches!(outcome, Err(RuntimeError::TokenizationMismatch { .. })),
            "{:?}",
            outcome
        );
    }

    #[tokio::test]
    async fn integer_overflow_is_an_error() {
        let outcome = try_run(r#"
argmax
    X = 9223372036854775807 + 1
    "Value: {X}"
from "random(seed=123)"
"#)
        .await;
        assert!(
            matches!(outcome, Err(RuntimeError::Eval(EvalError::Overflow { .. }))),
            "{:?}",
            outcome
        );
    }

    #[tokio::test]
    async fn type_errors_fail_runs_with_several_heads() {
        let outcome = try_run(r#"
sample(n=2)
    "Q:[OUT]"
from "random(seed=123)"
where
    len(OUT) < "x"
"#)
        .await;
        assert!(
            matches!(outcome, Err(RuntimeError::Eval(EvalError::TypeError { .. }))),
            "{:?}",
            outcome
        );
    }

    #[derive(Debug, Default)]
    struct Record {
        seen: Mutex<Vec<String>>,
    }

    impl Decorator for Record {
        fn stream(&self, value: &str, _ctx: &DecoratorContext) {
            self.seen.lock().unwrap().push(value.to_string());
        }
    }

    #[tokio::test]
    async fn stream_decorators_see_strictly_growing_prefixes() {
        let record = Arc::new(Record::default());
        let mut runtime = Runtime::new(config());
        runtime.decorators_mut().register("rec", record.clone());
        let outcome = runtime
            .run_source(
                r#"
argmax
    "Q:[@rec OUT]"
from "random(seed=123)"
where
    len(TOKENS(OUT)) < 4 and (OUT == "ab" or OUT == "xyz" or len(OUT) == 9)
"#,
                vec![],
            )
            .await;
        match &outcome {
            Ok(outcome) => {
                let out = text(outcome.best().unwrap(), "OUT");
                assert!(out == "ab" || out == "xyz", "{:?}", out);
            }
            Err(RuntimeError::GenerationStuck { .. }) => {}
            Err(e) => panic!("{}", e),
        }
        let seen = record.seen.lock().unwrap();
        assert!(!seen.is_empty());
        for pair in seen.windows(2) {
            assert!(
                pair[1].len() > pair[0].len() && pair[1].starts_with(pair[0].as_str()),
                "{:?} -> {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    fn write_vocabulary(dir: &std::path::Path) -> String {
        let mut tokens = vec!["</s>", "Hello", " you", "Hello you!", "Q", ":", " ", "!"];
        tokens.extend(["H", "e", "l", "o", "y", "u"]);
        let map: serde_json::Map<String, serde_json::Value> = tokens
            .iter()
            .enumerate()
            .map(|(id, text)| (id.to_string(), serde_json::Value::from(*text)))
            .collect();
        let path = dir.join("vocab.json");
        std::fs::write(&path, serde_json::Value::Object(map).to_string()).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn multi_character_tokens_reach_the_exact_value() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = write_vocabulary(dir.path());
        let result = run(&format!(
            r#"
argmax
    "Q:[OUT]"
from 'random(seed=5, vocab="{}")'
where
    OUT == "Hello you"
"#,
            vocab
        ))
        .await;
        assert_eq!(text(&result, "OUT"), "Hello you");
        assert_eq!(result.prompt, "Q:Hello you");
    }

    #[tokio::test]
    async fn multi_character_tokens_follow_a_regex() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = write_vocabulary(dir.path());
        let result = run(&format!(
            r#"
argmax
    "Q:[OUT]"
from 'random(seed=5, vocab="{}")'
where
    REGEX(OUT, "(Hello| you)+") and len(TOKENS(OUT)) < 4
"#,
            vocab
        ))
        .await;
        let mut rest = text(&result, "OUT");
        assert!(!rest.is_empty());
        while !rest.is_empty() {
            rest = match (rest.strip_prefix("Hello"), rest.strip_prefix(" you")) {
                (Some(r), _) | (None, Some(r)) => r.to_string(),
                _ => panic!("{:?} does not match", result.prompt),
            };
        }
    }

    fn follow_after(
        constraint: &str,
        value: &str,
        cache: &TokenSetCache,
        tokenizer: &dyn Tokenizer,
    ) -> FollowMap {
        let graph = OpGraph::compile(&parse_expr(constraint).unwrap()).unwrap();
        let base = ProgramState::new();
        let tokens: Vec<String> = value.chars().map(|c| c.to_string()).collect();
        let scope = HoleScope::new(&base, "OUT", value, &tokens);
        let ctx = OpContext {
            scope: &scope,
            active: Some("OUT"),
            cache,
            eos_token_id: tokenizer.eos_token_id(),
        };
        digest(&graph, &ctx, true).unwrap().follow.unwrap()
    }

    fn is_final_false_after(constraint: &str, value: &str, cache: &TokenSetCache) -> bool {
        let graph = OpGraph::compile(&parse_expr(constraint).unwrap()).unwrap();
        let base = ProgramState::new();
        let tokens: Vec<String> = value.chars().map(|c| c.to_string()).collect();
        let scope = HoleScope::new(&base, "OUT", value, &tokens);
        let ctx = OpContext {
            scope: &scope,
            active: Some("OUT"),
            cache,
            eos_token_id: 0,
        };
        digest(&graph, &ctx, false).unwrap().is_final_false()
    }

    const LAW_CASES: [(&str, &str); 7] = [
        (r#"OUT == "Hello you" or OUT == "Hello There""#, "Hello "),
        ("len(OUT) < 4", "ab"),
        ("len(TOKENS(OUT)) == 2", "a"),
        (r#"REGEX(OUT, "[0-9]+")"#, "12"),
        (r#"stops_at(OUT, ".") and len(OUT) < 10"#, "Hi"),
        (r#"OUT in ["yes", "no"]"#, "y"),
        (r#"OUT in "Hello world""#, "Hel"),
    ];

    #[test]
    fn masks_only_allow_tokens_that_keep_the_constraint_alive() {
        let tokenizer = tokenizer();
        let cache = TokenSetCache::new();
        let materialiser = Materialiser::new(tokenizer.as_ref(), &cache);
        let vocabulary = tokenizer.vocabulary().clone();
        for (constraint, value) in LAW_CASES {
            let follow = follow_after(constraint, value, &cache, tokenizer.as_ref());
            let mask = build_mask(&follow, &materialiser, &[], &TokenSet::empty());
            assert!(!mask.is_empty(), "{}", constraint);
            for id in mask.allowed_ids() {
                if id == tokenizer.eos_token_id() {
                    continue;
                }
                let Some(token) = vocabulary.token(id) else {
                    continue;
                };
                let Ok(token) = std::str::from_utf8(&token.0) else {
                    continue;
                };
                let next = format!("{}{}", value, token);
                assert!(
                    !is_final_false_after(constraint, &next, &cache),
                    "{} allows {:?} after {:?}",
                    constraint,
                    token,
                    value
                );
            }
        }
    }

    fn value_after(constraint: &str, value: &str, cache: &TokenSetCache) -> Tagged<Value> {
        let graph = OpGraph::compile(&parse_expr(constraint).unwrap()).unwrap();
        let base = ProgramState::new();
        let tokens: Vec<String> = value.chars().map(|c| c.to_string()).collect();
        let scope = HoleScope::new(&base, "OUT", value, &tokens);
        let ctx = OpContext {
            scope: &scope,
            active: Some("OUT"),
            cache,
            eos_token_id: 0,
        };
        digest(&graph, &ctx, false).unwrap().value
    }

    #[test]
    fn final_values_never_change_as_the_value_grows() {
        let cases = [
            (r#"OUT == "Hello""#, "Hello world"),
            ("len(OUT) < 4", "abcdef"),
            (r#"starts_with(OUT, "ab")"#, "abcd"),
            (r#"OUT in "Hello world""#, "Hello there"),
            (r#"REGEX(OUT, "[0-9]+")"#, "12a3"),
            (r#"OUT in ["yes", "no"]"#, "yesterday"),
        ];
        let cache = TokenSetCache::new();
        for (constraint, full) in cases {
            let mut settled: Option<(usize, Tagged<Value>)> = None;
            for end in 0..=full.len() {
                let current = value_after(constraint, &full[..end], &cache);
                match &settled {
                    Some((at, fixed)) => assert_eq!(
                        &current, fixed,
                        "{}: final after {:?} but not after {:?}",
                        constraint, &full[..*at], &full[..end]
                    ),
                    None if current.mono == Mono::Fin => settled = Some((end, current)),
                    None => {}
                }
            }
            assert!(settled.is_some(), "{} never settles on {:?}", constraint, full);
        }
    }

    #[test]
    fn forced_equality_allows_a_single_token() {
        let tokenizer = tokenizer();
        let cache = TokenSetCache::new();
        let materialiser = Materialiser::new(tokenizer.as_ref(), &cache);
        let follow = follow_after(r#"OUT == "Hello you""#, "Hel", &cache, tokenizer.as_ref());
        let mask = build_mask(&follow, &materialiser, &[], &TokenSet::empty());
        let l = tokenizer.vocabulary().token_id_of_text("l").unwrap();
        assert_eq!(mask.allowed_ids(), vec![l]);
        let blocked = build_mask(&follow, &materialiser, &[], &TokenSet::singleton(l));
        assert!(blocked.is_empty());
    }

    #[test]
    fn follow_maps_partition_the_vocabulary() {
        let tokenizer = tokenizer();
        let cache = TokenSetCache::new();
        let materialiser = Materialiser::new(tokenizer.as_ref(), &cache);
        for (constraint, value) in LAW_CASES {
            let follow = follow_after(constraint, value, &cache, tokenizer.as_ref());
            let cells: Vec<_> = follow
                .entries()
                .iter()
                .map(|(pattern, _)| pattern.materialise(&materialiser))
                .collect();
            for id in 0..tokenizer.vocab_size() {
                let owners = cells.iter().filter(|cell| cell.contains(id)).count();
                assert_eq!(owners, 1, "{}: token {} is in {} cells", constraint, id, owners);
            }
        }
    }

    #[test]
    fn follow_map_display() {
        let follow = FollowMap::new(vec![(
            TokenSet::singleton(5),
            Tagged::fin(FollowValue::Known(Value::Bool(false))),
        )]);
        assert_snapshot!(follow.to_string(), @r"
        {5} -> fin(False)
        *\{5} -> var(?)
        ");
    }

    #[test]
    fn op_graph_display() {
        let expr = parse_expr(r#"len(TOKENS(OUT)) < 3 and stops_at(OUT, ".")"#).unwrap();
        let graph = OpGraph::compile(&expr).unwrap();
        assert_snapshot!(graph.to_string(), @r#"and(<(len(TOKENS(OUT)), 3), STOPS_AT(OUT, "."))"#);
        assert_eq!(graph.max_tokens_hint("OUT"), Some(2));
    }

    #[test]
    fn intersections_materialise_to_conjunctions() {
        let tokenizer = tokenizer();
        let cache = TokenSetCache::new();
        let materialiser = Materialiser::new(tokenizer.as_ref(), &cache);
        let sets = vec![
            TokenSet::from_ids([1, 40, 72, 99]),
            TokenSet::all_except([40, 41]),
            TokenSet::from_literal_prefix("Hello"),
            TokenSet::predicate(TokenPredicate::StartsWith("H".to_string())),
            TokenSet::from_regex_tail(&Regex::new("[a-z]+").unwrap()),
            TokenSet::predicate(TokenPredicate::Measure {
                measure: Measure::Bytes,
                cmp: Comparison::Le,
                rhs: 1,
            }),
            TokenSet::from_literal_prefix("Hello").complement(),
        ];
        let ids = |bits: fixedbitset_stack::FixedBitSet| bits.ones().collect::<Vec<_>>();
        for a in &sets {
            for b in &sets {
                let mut expected = a.materialise(&materialiser);
                expected.intersect_with(&b.materialise(&materialiser));
                assert_eq!(
                    ids(a.intersect(b).materialise(&materialiser)),
                    ids(expected),
                    "{} & {}",
                    a,
                    b
                );
                let mut union = a.materialise(&materialiser);
                union.union_with(&b.materialise(&materialiser));
                assert_eq!(
                    ids(a.union(b).materialise(&materialiser)),
                    ids(union),
                    "{} | {}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn tokenizer_round_trips() {
        let tokenizer = tokenizer();
        for text in ["Hello, world!", "line\nbreak\ttab", "héllo wörld", "</s> is text", ""] {
            let ids = tokenizer.tokenize(text);
            assert_eq!(tokenizer.decode(&ids), text);
        }
        let tag = tokenizer.tokenize("<lmql:user/>hi");
        assert_eq!(tag[0] as usize, tokenizer.vocabulary().vocab_size() + 1);
        assert_eq!(tag.len(), 3);
    }

    #[test]
    fn regex_derivatives_agree_with_full_matches() {
        let patterns = ["[0-9]+", "ab|ac", "(ab)*c?", "a{2,3}b", " ?-?[0-9]+", "[^x]y"];
        let chars = ['a', 'b', 'c', 'x', 'y', '1', '-', ' '];
        let suffixes = ["", "b", "c", "y", "12", "abc", "aab"];
        let mut cache = DerivativeCache::new();
        for pattern in patterns {
            let regex = Regex::new(pattern).unwrap();
            for a in chars {
                for b in chars {
                    let derived = regex.derive_str(&a.to_string()).derive_str(&b.to_string());
                    for s in suffixes {
                        let whole = format!("{}{}{}", a, b, s);
                        assert_eq!(
                            derived.fullmatch(s),
                            regex.fullmatch(&whole),
                            "/{}/ on {:?}",
                            pattern,
                            whole
                        );
                        assert_eq!(cache.fullmatch(&regex, &whole), regex.fullmatch(&whole));
                        assert_eq!(
                            cache.is_viable(&regex, &whole),
                            regex.is_viable_prefix(&whole)
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn regex_display() {
        let digits = Regex::new("[0-9]+").unwrap();
        assert_snapshot!(digits.derive_str("12").to_string(), @"[0-9]*");
        let alt = Regex::new("ab|ac").unwrap();
        assert_snapshot!(alt.derive_str("a").to_string(), @"b|c");
    }

    #[test]
    fn dead_prefixes_are_remembered_per_regex() {
        let regex = Regex::new("[a-z]+").unwrap();
        let mut cache = DerivativeCache::new();
        assert!(!cache.is_viable(&regex, "ab1"));
        let exported = cache.export_dead_prefixes();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].0, regex.to_string());
        assert!(exported[0].1.has_dead_prefix("ab1cd"));
        let mut fresh = DerivativeCache::new();
        fresh.import_dead_prefixes(exported);
        assert!(!fresh.is_viable(&regex, "ab1x"));
        assert!(fresh.is_viable(&regex, "abc"));
    }

    #[test]
    fn backtracker_terminates() {
        let mut backtracker = Backtracker::new(1000);
        let mut value = vec![3, 4, 5];
        let mut steps = 0;
        while let Ok(len) = backtracker.dead_end(&value) {
            value.truncate(len);
            steps += 1;
            assert!(steps <= 1000);
        }
        assert_eq!(value, Vec::<u32>::new());
        assert_eq!(steps, 3);
    }
}
