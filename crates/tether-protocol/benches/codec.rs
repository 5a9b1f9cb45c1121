//! Codec benchmarks for tether-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tether_protocol::{codec, ClientEvent, Encoding, Location, MemberInfo, ServerEvent};

fn location_update() -> ServerEvent {
    ServerEvent::MemberLocationUpdated {
        member_id: "9b2f6c0e-3c1e-4d8a-a1a4-0c7d5f1e2b3a".into(),
        name: "Alice".into(),
        location: Location::new(40.7128, -74.006),
        timestamp: 1_700_000_000_000,
    }
}

fn bench_encode(c: &mut Criterion) {
    let event = location_update();

    let mut group = c.benchmark_group("encode");
    group.bench_function("location_json", |b| {
        b.iter(|| codec::encode(black_box(&event), Encoding::Json))
    });
    group.bench_function("location_msgpack", |b| {
        b.iter(|| codec::encode(black_box(&event), Encoding::MessagePack))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let event = ClientEvent::location("ABC123", "member-1", Location::new(40.7128, -74.006));
    let text = serde_json::to_string(&event).unwrap();
    let binary = codec::encode_binary(&event).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("location_json", |b| {
        b.iter(|| codec::decode_text::<ClientEvent>(black_box(&text)))
    });
    group.bench_function("location_msgpack", |b| {
        b.iter(|| codec::decode_binary::<ClientEvent>(black_box(&binary)))
    });
    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let members = (0..50)
        .map(|i| MemberInfo {
            id: format!("member-{i}"),
            name: format!("Member {i}"),
            location: Some(Location::new(40.0 + f64::from(i) * 0.01, -74.0)),
            last_seen: 1_700_000_000_000,
            is_online: i % 2 == 0,
        })
        .collect();
    let event = ServerEvent::FamilyMembers(members);

    c.bench_function("snapshot_50_members_json", |b| {
        b.iter(|| codec::encode(black_box(&event), Encoding::Json).unwrap())
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_snapshot);
criterion_main!(benches);
