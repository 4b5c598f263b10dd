use criterion::{black_box, criterion_group, criterion_main, Criterion};

use graphite_query::parse;

const SIMPLE: &str = "foo.bar.baz";
const GLOB: &str = "servers.{web,api}.*.cpu.[0-9]";
const NESTED: &str =
    "aliasByNode(movingAverage(summarize(servers.*.cpu.total,'5min','avg'),'10min'),1,-1)";
const CHAINED: &str = "servers.*.cpu.total|summarize('5min','avg')|movingAverage('10min')|aliasByNode(1)";

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for (name, query) in [
        ("metric", SIMPLE),
        ("glob", GLOB),
        ("nested", NESTED),
        ("chained", CHAINED),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| parse(black_box(query)).unwrap());
        });
    }
    group.finish();
}

fn bench_to_query_string(c: &mut Criterion) {
    let expr = parse(NESTED).unwrap();
    c.bench_function("to_query_string/nested", |b| {
        b.iter(|| black_box(&expr).to_query_string());
    });
}

criterion_group!(benches, bench_parse, bench_to_query_string);
criterion_main!(benches);
