//! Benchmarks for the per-tick hot paths of the tail agent.

use std::hint::black_box;
use std::path::{Path, PathBuf};

use chrono::{Duration, TimeZone, Utc};
use criterion::{Criterion, criterion_group, criterion_main};

use tail_agent::{
    parser::parser::{LineFormat, LineParser},
    position::models::position_file_name,
    watcher::{models::LogFile, pattern::PatternMatcher, selector::select_latest},
};

fn benchmark_pattern_match(c: &mut Criterion) {
    let matcher = PatternMatcher::new("logstash-*.json").expect("pattern");
    let names: Vec<String> = (0..1000)
        .map(|i| {
            if i % 2 == 0 {
                format!("logstash-2024.01.{i:04}.json")
            } else {
                format!("app-{i}.log")
            }
        })
        .collect();

    c.bench_function("pattern_match_1k_names", |b| {
        b.iter(|| names.iter().filter(|name| matcher.is_match(black_box(name))).count());
    });
}

fn benchmark_select_latest(c: &mut Criterion) {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid date");
    let files: Vec<LogFile> = (0..1000)
        .map(|i| LogFile {
            path: PathBuf::from(format!("/var/log/app/logstash-{i}.json")),
            filename: format!("logstash-{i}.json"),
            modified_at: base + Duration::seconds((i * 7919) % 1000),
            size: 1024,
        })
        .collect();

    c.bench_function("select_latest_1k_files", |b| {
        b.iter(|| select_latest(black_box(files.clone())));
    });
}

fn benchmark_position_file_name(c: &mut Criterion) {
    let path = Path::new("/var/log/app/logstash-2024.01.01.json");

    c.bench_function("position_file_name", |b| {
        b.iter(|| position_file_name(black_box("api"), black_box(path)));
    });
}

fn benchmark_parse_json_line(c: &mut Criterion) {
    let parser = LineParser::new(LineFormat::Json);
    let source = Path::new("/var/log/app/logstash-2024.01.01.json");
    let line = r#"{"@timestamp":"2024-01-01T12:00:00Z","level":"warn","message":"disk almost full","host":"web-1","pct":91}"#;

    c.bench_function("parse_json_line", |b| {
        b.iter(|| parser.parse(black_box(line), source));
    });
}

criterion_group!(
    benches,
    benchmark_pattern_match,
    benchmark_select_latest,
    benchmark_position_file_name,
    benchmark_parse_json_line
);
criterion_main!(benches);
