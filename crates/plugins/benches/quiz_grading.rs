use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::{Map, Value as JsonValue, json};

use formplug_plugins::{QuizField, QuizGradingSettings, grade};

fn quiz(fields: usize) -> (QuizGradingSettings, Map<String, JsonValue>) {
    let settings = QuizGradingSettings {
        quiz_fields: (0..fields)
            .map(|i| QuizField {
                field_id: format!("q{i}"),
                field_label: Some(format!("Question {i}")),
                correct_answer: json!(format!("answer-{i}")),
                marks: f64::from(1 + (i as u32 % 5)),
            })
            .collect(),
        pass_threshold: 60.0,
    };
    let answers = (0..fields)
        .map(|i| {
            let value = if i % 3 == 0 { json!("wrong") } else { json!(format!("answer-{i}")) };
            (format!("q{i}"), value)
        })
        .collect();
    (settings, answers)
}

fn bench_grade(c: &mut Criterion) {
    let mut group = c.benchmark_group("quiz_grading");
    for size in [10usize, 100, 1000] {
        let (settings, answers) = quiz(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| grade(black_box(&settings), black_box(&answers)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_grade);
criterion_main!(benches);
