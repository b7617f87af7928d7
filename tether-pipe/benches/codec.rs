//! Payload codec benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tether_pipe::protocol::{
    build_payload, has_more_groups, parse_payload, FileInfo, FileStat, Tag, Value,
};

fn getattr_reply() -> Vec<Value> {
    let stat = FileStat {
        ino: 42,
        mode: libc::S_IFREG | 0o644,
        size: 4096,
        ..Default::default()
    };
    vec![Value::Stat(stat), Value::End]
}

fn bench_build_getattr_reply(c: &mut Criterion) {
    let values = getattr_reply();
    c.bench_function("build_getattr_reply", |b| {
        b.iter(|| {
            let mut buf = Vec::new();
            build_payload(&mut buf, black_box(&values)).unwrap();
            black_box(buf)
        })
    });
}

fn bench_parse_getattr_reply(c: &mut Criterion) {
    let mut payload = Vec::new();
    build_payload(&mut payload, &getattr_reply()).unwrap();

    c.bench_function("parse_getattr_reply", |b| {
        b.iter(|| {
            let mut offset = 0;
            black_box(parse_payload(&payload, &mut offset, &[Tag::Stat, Tag::End]).unwrap())
        })
    });
}

fn bench_write_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_write_request");
    for size in [4096usize, 65536, 131072] {
        let values = vec![
            Value::path("/data/file.bin"),
            Value::Buffer(vec![0u8; size]),
            Value::Int(0),
            Value::FileInfo(FileInfo::with_handle(1)),
            Value::End,
        ];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}kb", size / 1024), |b| {
            b.iter(|| {
                let mut buf = Vec::new();
                build_payload(&mut buf, black_box(&values)).unwrap();
                black_box(buf)
            })
        });
    }
    group.finish();
}

fn bench_parse_readdir_1000(c: &mut Criterion) {
    let mut payload = Vec::new();
    build_payload(&mut payload, &[Value::FileInfo(FileInfo::default()), Value::BlockEnd]).unwrap();
    for i in 0..1000u64 {
        let group = [
            Value::path(format!("entry-{:04}", i)),
            Value::Stat(FileStat::dir_entry(i, libc::DT_REG)),
            Value::BlockEnd,
        ];
        build_payload(&mut payload, &group).unwrap();
    }
    build_payload(&mut payload, &[Value::End]).unwrap();

    c.bench_function("parse_readdir_1000", |b| {
        b.iter(|| {
            let mut pos = 0;
            parse_payload(&payload, &mut pos, &[Tag::FileInfo, Tag::BlockEnd]).unwrap();
            let mut entries = 0;
            while has_more_groups(&payload, pos) {
                parse_payload(&payload, &mut pos, &[Tag::Buffer, Tag::Stat, Tag::BlockEnd])
                    .unwrap();
                entries += 1;
            }
            parse_payload(&payload, &mut pos, &[Tag::End]).unwrap();
            black_box(entries)
        })
    });
}

criterion_group!(
    benches,
    bench_build_getattr_reply,
    bench_parse_getattr_reply,
    bench_write_request,
    bench_parse_readdir_1000,
);
criterion_main!(benches);
