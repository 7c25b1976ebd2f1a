//! Admission policy tests across the full class/mode space

use super::test_utils::inbound_udp;
use crate::classifier::PacketClassifier;
use crate::packet::{Direction, Protocol};
use crate::policy::{Decision, PolicyEngine};
use crate::session::{SessionMode, SessionModeStateMachine};
use crate::signature::{LengthRange, PortPredicate, SignatureEntry, SignatureTable, TrafficClass};
use crate::whitelist::WhitelistStore;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SAMPLE_SOURCES: [&str; 4] = [
    "203.0.113.1",
    "198.51.100.77",
    "10.1.2.3",
    "2001:db8::42",
];

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn engine() -> PolicyEngine {
    PolicyEngine::new(
        Arc::new(WhitelistStore::new()),
        Arc::new(SessionModeStateMachine::default()),
    )
}

fn decide_in(
    engine: &PolicyEngine,
    mode: SessionMode,
    class: TrafficClass,
    source: &str,
) -> Decision {
    engine.session().transition(mode);
    engine.admit(class, Some(ip(source)))
}

/// Heartbeat 52-60 bytes, session data 200-800 bytes
fn scenario_table() -> SignatureTable {
    let heartbeat = SignatureEntry {
        class: TrafficClass::Heartbeat,
        direction: Direction::Inbound,
        protocol: Protocol::Udp,
        ports: PortPredicate::Any,
        length: LengthRange::new(52, 60),
    };
    let session_data = SignatureEntry {
        class: TrafficClass::SessionData,
        length: LengthRange::new(200, 800),
        ..heartbeat.clone()
    };
    SignatureTable::new("scenario", vec![heartbeat, session_data]).unwrap()
}

#[test]
fn test_unmatched_lengths_drop_in_every_mode() {
    let classifier = PacketClassifier::new(scenario_table()).unwrap();
    let engine = engine();

    for len in [0, 1, 51, 61, 199, 801, 900, 1400] {
        let raw = inbound_udp("203.0.113.1", len);
        let classification = classifier.classify_raw(Direction::Inbound, &raw);
        assert_eq!(classification.class, TrafficClass::Unclassified, "length {}", len);

        for mode in SessionMode::ALL {
            engine.session().transition(mode);
            assert_eq!(
                engine.admit(classification.class, classification.remote_addr()),
                Decision::Drop,
                "length {} in {}",
                len,
                mode
            );
        }
    }
}

#[test]
fn test_control_traffic_always_allowed() {
    let engine = engine();
    for mode in SessionMode::ALL {
        for class in [TrafficClass::Heartbeat, TrafficClass::Matchmaking] {
            for source in SAMPLE_SOURCES {
                assert_eq!(decide_in(&engine, mode, class, source), Decision::Allow);
            }
            assert_eq!(engine.admit(class, None), Decision::Allow);
        }
    }
}

#[test]
fn test_whitelisted_mode_tracks_store_without_lag() {
    let engine = engine();
    engine.session().transition(SessionMode::Whitelisted);
    let whitelist = Arc::clone(engine.whitelist());

    for source in SAMPLE_SOURCES {
        let addr = ip(source);
        assert_eq!(engine.admit(TrafficClass::SessionData, Some(addr)), Decision::Drop);

        whitelist.add(addr);
        assert_eq!(engine.admit(TrafficClass::SessionData, Some(addr)), Decision::Allow);

        whitelist.remove(&addr);
        assert_eq!(engine.admit(TrafficClass::SessionData, Some(addr)), Decision::Drop);
    }
}

#[test]
fn test_solo_ignores_whitelist() {
    let engine = engine();
    for source in SAMPLE_SOURCES {
        engine.whitelist().add(ip(source));
    }
    for source in SAMPLE_SOURCES {
        assert_eq!(
            decide_in(&engine, SessionMode::Solo, TrafficClass::SessionData, source),
            Decision::Drop
        );
    }
}

#[test]
fn test_locked_freezes_authorised_set() {
    let engine = engine();
    let early = ip("203.0.113.1");
    let late = ip("198.51.100.77");

    engine.session().transition(SessionMode::Public);
    assert_eq!(engine.admit(TrafficClass::SessionData, Some(early)), Decision::Allow);

    engine.session().transition(SessionMode::Locked);
    assert_eq!(engine.admit(TrafficClass::SessionData, Some(early)), Decision::Allow);
    assert_eq!(engine.admit(TrafficClass::SessionData, Some(late)), Decision::Drop);

    // rejected packets never join the active set
    engine.session().transition(SessionMode::Locked);
    assert_eq!(engine.admit(TrafficClass::SessionData, Some(late)), Decision::Drop);
    assert_eq!(engine.admit(TrafficClass::SessionData, Some(early)), Decision::Allow);
}

#[test]
fn test_whitelist_idempotence() {
    let store = WhitelistStore::new();
    assert!(!store.remove(&ip("203.0.113.1")));
    assert!(store.list().is_empty());

    store.add(ip("203.0.113.1"));
    let len = store.list().len();
    store.add(ip("203.0.113.1"));
    assert_eq!(store.list().len(), len);
}

#[test]
fn test_signature_scenario() {
    let classifier = PacketClassifier::new(scenario_table()).unwrap();
    let engine = engine();
    let stranger = "198.51.100.9";

    let heartbeat = classifier.classify_raw(Direction::Inbound, &inbound_udp(stranger, 55));
    assert_eq!(heartbeat.class, TrafficClass::Heartbeat);
    engine.session().transition(SessionMode::Locked);
    assert_eq!(engine.admit(heartbeat.class, heartbeat.remote_addr()), Decision::Allow);

    let unknown = classifier.classify_raw(Direction::Inbound, &inbound_udp(stranger, 900));
    assert_eq!(unknown.class, TrafficClass::Unclassified);
    for mode in SessionMode::ALL {
        engine.session().transition(mode);
        assert_eq!(engine.admit(unknown.class, unknown.remote_addr()), Decision::Drop);
    }

    let data = classifier.classify_raw(Direction::Inbound, &inbound_udp(stranger, 400));
    assert_eq!(data.class, TrafficClass::SessionData);
    engine.session().transition(SessionMode::Whitelisted);
    assert_eq!(engine.admit(data.class, data.remote_addr()), Decision::Drop);
    engine.session().transition(SessionMode::Public);
    assert_eq!(engine.admit(data.class, data.remote_addr()), Decision::Allow);
}

#[test]
fn test_concurrent_whitelist_edits_during_admission() {
    let engine = Arc::new(engine());
    engine.session().transition(SessionMode::Whitelisted);
    let addr = ip("203.0.113.50");

    let editor = {
        let whitelist = Arc::clone(engine.whitelist());
        std::thread::spawn(move || {
            for _ in 0..1000 {
                whitelist.add(addr);
                whitelist.remove(&addr);
            }
        })
    };
    for _ in 0..1000 {
        // either answer is valid mid-edit; it must never panic or deadlock
        let _ = engine.admit(TrafficClass::SessionData, Some(addr));
    }
    editor.join().unwrap();

    assert_eq!(engine.admit(TrafficClass::SessionData, Some(addr)), Decision::Drop);
}

#[test]
fn test_admissions_racing_lock_land_in_snapshot() {
    let engine = Arc::new(PolicyEngine::new(
        Arc::new(WhitelistStore::new()),
        Arc::new(SessionModeStateMachine::new(Duration::from_secs(60), 65536)),
    ));
    engine.session().transition(SessionMode::Public);

    let stop = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicUsize::new(0));
    let admitters: Vec<_> = (0..4u8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            let started = Arc::clone(&started);
            std::thread::spawn(move || {
                let mut admitted_public = Vec::new();
                for n in 0..5000u16 {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let [hi, lo] = n.to_be_bytes();
                    let source = IpAddr::from([10, t, hi, lo]);
                    engine
                        .session()
                        .admit(TrafficClass::SessionData, Some(source), |state| {
                            let allow = engine
                                .decide(TrafficClass::SessionData, Some(source), state)
                                .is_allow();
                            if allow && state.mode == SessionMode::Public {
                                admitted_public.push(source);
                            }
                            allow
                        });
                    if n == 0 {
                        started.fetch_add(1, Ordering::SeqCst);
                    }
                }
                admitted_public
            })
        })
        .collect();

    while started.load(Ordering::SeqCst) < 4 {
        std::thread::yield_now();
    }
    let transition = engine.session().transition(SessionMode::Locked);
    stop.store(true, Ordering::Relaxed);

    let locked = engine.session().snapshot().locked_peers;
    assert_eq!(transition.locked_peers, locked.len());
    let mut checked = 0;
    for admitter in admitters {
        for source in admitter.join().unwrap() {
            assert!(locked.contains(&source), "{} admitted before the lock", source);
            checked += 1;
        }
    }
    assert!(checked >= 4);
}
