//! Benchmarks for the SessionGuard packet path

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sessionguard::{
    Direction, PacketClassifier, PolicyEngine, SessionMode, SessionModeStateMachine, WhitelistStore,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// IPv4/UDP packet to the game port with a zeroed payload
fn game_packet(src: Ipv4Addr, payload_len: usize) -> Vec<u8> {
    let udp_len = 8 + payload_len as u16;
    let total_len = 20 + udp_len;

    let mut packet = vec![0x45, 0x00];
    packet.extend_from_slice(&total_len.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00, 0x40, 0x00, 64, 17, 0x00, 0x00]);
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&[192, 168, 1, 10]);
    packet.extend_from_slice(&6672u16.to_be_bytes());
    packet.extend_from_slice(&6672u16.to_be_bytes());
    packet.extend_from_slice(&udp_len.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]);
    packet.resize(packet.len() + payload_len, 0);
    packet
}

fn classify_benchmark(c: &mut Criterion) {
    let classifier = PacketClassifier::default();
    let heartbeat = game_packet(Ipv4Addr::new(203, 0, 113, 1), 63);
    let session_data = game_packet(Ipv4Addr::new(203, 0, 113, 1), 900);

    c.bench_function("classify_heartbeat", |b| {
        b.iter(|| black_box(classifier.classify_raw(Direction::Inbound, black_box(&heartbeat))))
    });
    c.bench_function("classify_session_data", |b| {
        b.iter(|| {
            black_box(classifier.classify_raw(Direction::Inbound, black_box(&session_data)))
        })
    });
}

fn admit_benchmark(c: &mut Criterion) {
    let whitelist = Arc::new(WhitelistStore::new());
    for i in 0..1024u32 {
        whitelist.add(IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i)));
    }
    let session = Arc::new(SessionModeStateMachine::default());
    session.transition(SessionMode::Whitelisted);

    let classifier = PacketClassifier::default();
    let policy = PolicyEngine::new(whitelist, session);
    let packet = game_packet(Ipv4Addr::new(10, 0, 2, 1), 400);

    c.bench_function("classify_and_admit_whitelisted", |b| {
        b.iter(|| {
            let classification = classifier.classify_raw(Direction::Inbound, black_box(&packet));
            black_box(policy.admit(classification.class, classification.remote_addr()))
        })
    });
}

criterion_group!(benches, classify_benchmark, admit_benchmark);
criterion_main!(benches);
