use criterion::{black_box, criterion_group, criterion_main, Criterion};
use yunikorn_history::event::{decode_lines, StreamDecoder};
use yunikorn_history::repository::{EventRepository, InMemoryEventRepository};

const TYPES: [&str; 5] = ["REQUEST", "APP", "NODE", "QUEUE", "USERGROUP"];
const CHANGES: [&str; 4] = ["NONE", "SET", "ADD", "REMOVE"];

fn stream_body(records: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(records * 200);
    for i in 0..records {
        let line = format!(
            "{{\"type\":\"{}\",\"eventChangeType\":\"{}\",\"eventChangeDetail\":206,\
             \"objectID\":\"application-{i}\",\"referenceID\":\"alloc-{i}\",\
             \"message\":\"\",\"timestampNano\":{},\
             \"resource\":{{\"resources\":{{\"memory\":{{\"value\":1073741824}},\"vcore\":{{\"value\":1000}}}}}}}}\n",
            TYPES[i % TYPES.len()],
            CHANGES[i % CHANGES.len()],
            1_700_000_000_000_000_000i64 + i as i64,
        );
        body.extend_from_slice(line.as_bytes());
    }
    body
}

fn bench_decode(c: &mut Criterion) {
    let body = stream_body(1_000);

    c.bench_function("decode_lines/1k_records", |b| {
        b.iter(|| {
            let decoded = decode_lines(black_box(&body));
            black_box(decoded.records.len())
        })
    });

    c.bench_function("stream_decoder/1k_records_4k_chunks", |b| {
        b.iter(|| {
            let mut decoder = StreamDecoder::new();
            let mut n = 0;
            for chunk in body.chunks(4096) {
                n += decoder.push(black_box(chunk)).len();
            }
            black_box(n)
        })
    });
}

fn bench_count(c: &mut Criterion) {
    let records: Vec<_> = decode_lines(&stream_body(1_000))
        .records
        .into_iter()
        .filter_map(Result::ok)
        .collect();

    c.bench_function("event_repository/record_1k", |b| {
        b.iter(|| {
            let events = InMemoryEventRepository::new();
            for record in &records {
                events.record(black_box(record)).expect("record");
            }
            black_box(events.total())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_decode(c);
    bench_count(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
