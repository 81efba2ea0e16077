//! Concurrency tests
//!
//! Tests:
//! - Parallel mutations on separate applications
//! - Tracks moved back and forth between two applications while other
//!   threads edit both (lock ordering, discovery retry)
//! - Multi-read consistency under a held session lock

use std::sync::Arc;
use std::thread;

use rf_core::SessionConfig;
use rf_session::{LocalEngine, NodeId, Registry, Target};
use serial_test::serial;

// ═══════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Registry with two applications booted on one engine
fn two_sessions() -> (Arc<Registry>, NodeId, NodeId, Arc<LocalEngine>) {
    init_logging();
    let registry = Arc::new(Registry::new());
    let config = SessionConfig::default();
    let engine = Arc::new(LocalEngine::for_config(&config));
    let first = registry.new_application(config.clone()).unwrap();
    let second = registry.new_application(config).unwrap();
    registry.boot(first, engine.clone(), None).unwrap();
    registry.boot(second, engine.clone(), None).unwrap();
    (registry, first, second, engine)
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[test]
#[serial]
fn test_parallel_sessions() {
    let (registry, first, second, _engine) = two_sessions();
    let workers: Vec<_> = [first, second, first, second]
        .into_iter()
        .map(|app| {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    let track = registry.add_track(app, None).unwrap();
                    registry.mute(track).unwrap();
                    registry.solo(track, false).unwrap();
                    registry.unmute(track).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(registry.tracks(first).unwrap().len(), 50);
    assert_eq!(registry.tracks(second).unwrap().len(), 50);
}

#[test]
#[serial]
fn test_cross_session_moves_do_not_deadlock() {
    let (registry, first, second, engine) = two_sessions();
    let wanderer = registry.add_track(first, Some("wanderer")).unwrap();

    let mover = {
        let registry = registry.clone();
        thread::spawn(move || {
            for i in 0..50 {
                let owner = if i % 2 == 0 { second } else { first };
                registry.move_track(wanderer, owner, 0).unwrap();
            }
        })
    };
    let editors: Vec<_> = [first, second]
        .into_iter()
        .map(|app| {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let track = registry.add_track(app, None).unwrap();
                    registry.add_send(track, Target::Default, false).unwrap();
                    registry.delete(track).unwrap();
                }
            })
        })
        .collect();
    mover.join().unwrap();
    for editor in editors {
        editor.join().unwrap();
    }

    // 50 moves end where it started
    assert_eq!(registry.application_of(wanderer), Some(first));
    assert_eq!(registry.tracks(first).unwrap(), vec![wanderer]);
    assert!(registry.tracks(second).unwrap().is_empty());
    let master = registry.master_track(first).unwrap();
    let send = registry.sends(wanderer, true).unwrap()[0];
    assert_eq!(registry.send_target(send).unwrap(), Some(master));
    assert!(engine.is_live(registry.handle(wanderer).unwrap()));
}

#[test]
#[serial]
fn test_held_session_lock_gives_consistent_reads() {
    let (registry, first, _second, _engine) = two_sessions();
    let writer = {
        let registry = registry.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                registry.add_track(first, None).unwrap();
            }
        })
    };
    for _ in 0..20 {
        let lock = registry.session_lock(first).unwrap();
        let _guard = lock.lock();
        let tracks = registry.tracks(first).unwrap();
        let master = registry.master_track(first).unwrap();
        // every track's default send is registered with master
        assert_eq!(registry.incoming_sends(master).len(), tracks.len());
    }
    writer.join().unwrap();
    assert_eq!(registry.tracks(first).unwrap().len(), 50);
}
