use criterion::{criterion_group, criterion_main, Criterion};
use netprobe::classify::{classify, Verdict};
use netprobe::packet::checksum;
use netprobe::packet::codec::{
    build_echo_reply, build_echo_request, build_icmp_error, build_ipv4_datagram, parse_reply,
};
use netprobe::ProbeRequest;
use std::hint::black_box;
use std::net::Ipv4Addr;

const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const REMOTE: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);
const ROUTER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

fn benchmark_checksum(c: &mut Criterion) {
    let buffer = vec![0xa5u8; 1472];
    c.bench_function("checksum_1472_bytes", |b| {
        b.iter(|| checksum::compute(black_box(&buffer)))
    });
}

fn benchmark_echo_request(c: &mut Criterion) {
    c.bench_function("build_echo_request", |b| {
        b.iter(|| build_echo_request(black_box(0x1234), black_box(7), black_box(b"Ping")))
    });
}

fn benchmark_parse_and_classify(c: &mut Criterion) {
    let request = ProbeRequest::echo(0x1234, 7, REMOTE, b"Ping".to_vec()).with_ttl(3);
    let echo = build_ipv4_datagram(REMOTE, LOCAL, 1, 64, &build_echo_reply(0x1234, 7, b"Ping"));
    let probe = build_ipv4_datagram(LOCAL, REMOTE, 1, 1, &build_echo_request(0x1234, 7, b"Ping"));
    let time_exceeded =
        build_ipv4_datagram(ROUTER, LOCAL, 1, 64, &build_icmp_error(11, 0, [0; 4], &probe));

    c.bench_function("parse_classify_echo_reply", |b| {
        b.iter(|| {
            let reply = parse_reply(black_box(&echo)).ok()?;
            match classify(&reply, &request, None, 1.0) {
                Verdict::Matched(outcome) => Some(outcome),
                _ => None,
            }
        })
    });

    c.bench_function("parse_classify_time_exceeded", |b| {
        b.iter(|| {
            let reply = parse_reply(black_box(&time_exceeded)).ok()?;
            match classify(&reply, &request, None, 1.0) {
                Verdict::Matched(outcome) => Some(outcome),
                _ => None,
            }
        })
    });
}

criterion_group!(
    benches,
    benchmark_checksum,
    benchmark_echo_request,
    benchmark_parse_and_classify
);
criterion_main!(benches);
