use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relaycraft_proxy::flow::{Flow, FlowRequest, Headers};
use relaycraft_proxy::rules::atom::{Atom, AtomType, AtomValue, MatchType};
use relaycraft_proxy::rules::matcher::match_rule;
use relaycraft_proxy::rules::rule::{CombineMode, MatchBlock, Rule};

fn url_atom(match_type: MatchType, value: &str) -> Atom {
    let mut atom = Atom {
        atom_type: AtomType::Url,
        match_type,
        key: None,
        value: Some(AtomValue::Single(value.to_string())),
        invert: false,
        compiled: None,
    };
    atom.compile();
    atom
}

fn rule_matching_path(id: usize, path: &str, is_regex: bool) -> Rule {
    let atom = if is_regex {
        url_atom(MatchType::Regex, &format!(r"^https://example\.com{path}$"))
    } else {
        url_atom(MatchType::Contains, path)
    };
    Rule {
        id: format!("rule-{id}"),
        name: format!("rule-{id}"),
        enabled: true,
        priority: id as i32,
        stop_on_match: false,
        match_block: MatchBlock {
            combine: CombineMode::All,
            request: vec![atom],
        },
        actions: Vec::new(),
        source_path: None,
    }
}

fn build_rules(count: usize, regex: bool) -> Vec<Rule> {
    (0..count)
        .map(|i| rule_matching_path(i, &format!("/api/v1/endpoint{i}"), regex))
        .collect()
}

fn flow_for_path(path: &str) -> Flow {
    let request = FlowRequest {
        method: "GET".to_string(),
        url: format!("https://example.com{path}"),
        host: "example.com".to_string(),
        path: path.to_string(),
        port: 443,
        headers: Headers::new(),
        body: Vec::new(),
        started_at: chrono::Utc::now(),
    };
    Flow::new("bench-flow".to_string(), request, None)
}

fn bench_rule_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule_matching");

    for rule_count in [10, 50, 100, 500, 1000] {
        let rules = build_rules(rule_count, false);

        let flow_first = flow_for_path("/api/v1/endpoint0");
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("match_first", rule_count), &rule_count, |b, _| {
            b.iter(|| {
                rules
                    .iter()
                    .find(|rule| match_rule(black_box(&flow_first), rule).matched)
            });
        });

        let middle = rule_count / 2;
        let flow_middle = flow_for_path(&format!("/api/v1/endpoint{middle}"));
        group.bench_with_input(BenchmarkId::new("match_middle", rule_count), &rule_count, |b, _| {
            b.iter(|| {
                rules
                    .iter()
                    .find(|rule| match_rule(black_box(&flow_middle), rule).matched)
            });
        });

        let flow_none = flow_for_path("/not/found");
        group.bench_with_input(BenchmarkId::new("match_none", rule_count), &rule_count, |b, _| {
            b.iter(|| {
                rules
                    .iter()
                    .find(|rule| match_rule(black_box(&flow_none), rule).matched)
            });
        });
    }

    group.finish();
}

fn bench_regex_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("regex_matching");

    for rule_count in [10, 50, 100] {
        let rules = build_rules(rule_count, true);
        let flow = flow_for_path("/api/v1/endpoint50");

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("regex_match", rule_count), &rule_count, |b, _| {
            b.iter(|| {
                rules
                    .iter()
                    .find(|rule| match_rule(black_box(&flow), rule).matched)
            });
        });
    }

    group.finish();
}

fn bench_single_rule_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_rule_eval");

    let rule = rule_matching_path(0, "/api/v1/test", false);
    let flow = flow_for_path("/api/v1/test");

    group.throughput(Throughput::Elements(1));
    group.bench_function("single_match", |b| {
        b.iter(|| match_rule(black_box(&flow), black_box(&rule)));
    });

    group.finish();
}

fn bench_candidate_selection(c: &mut Criterion) {
    use relaycraft_proxy::rules::loader::RuleSet;
    use std::collections::HashMap;

    let mut group = c.benchmark_group("candidate_selection");

    for host_count in [10, 100, 1000] {
        let mut exact_host_index: HashMap<String, Vec<Rule>> = HashMap::new();
        for i in 0..host_count {
            exact_host_index.insert(format!("host{i}.example.com"), vec![rule_matching_path(i, "/x", false)]);
        }
        let ruleset = RuleSet {
            global: Vec::new(),
            exact_host_index,
            complex_host: Vec::new(),
        };

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("candidates_for_host", host_count),
            &host_count,
            |b, _| {
                b.iter(|| ruleset.candidates_for_host(black_box("host5.example.com")));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_rule_matching,
    bench_regex_matching,
    bench_single_rule_evaluation,
    bench_candidate_selection
);
criterion_main!(benches);
