//! Property tests for mute/solo propagation
//!
//! Layout under test (application track container):
//!
//! ```text
//! a
//! g ── b
//!   └─ c ── d
//! ```
//!
//! For every mute/solo combination, each track must end up with
//! `active = !muted_at_or_above && (nothing_soloed || solo_reachable)`.

use std::sync::Arc;

use proptest::prelude::*;
use rf_core::SessionConfig;
use rf_session::{LocalEngine, NodeId, Registry, StageKind};

// ═══════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════

const TRACKS: usize = 5;
/// Parent index of each track; `None` for top-level tracks
const PARENTS: [Option<usize>; TRACKS] = [None, None, Some(1), Some(1), Some(3)];

struct Session {
    registry: Registry,
    engine: Arc<LocalEngine>,
    tracks: [NodeId; TRACKS],
}

fn session() -> Session {
    let registry = Registry::new();
    let config = SessionConfig::default();
    let engine = Arc::new(LocalEngine::for_config(&config));
    let app = registry.new_application(config).unwrap();
    registry.boot(app, engine.clone(), None).unwrap();

    let a = registry.add_track(app, Some("a")).unwrap();
    let g = registry.add_group_track(app, Some("g")).unwrap();
    let b = registry.add_track(g, Some("b")).unwrap();
    let c = registry.add_group_track(g, Some("c")).unwrap();
    let d = registry.add_track(c, Some("d")).unwrap();
    Session {
        registry,
        engine,
        tracks: [a, g, b, c, d],
    }
}

fn ancestors(index: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut current = PARENTS[index];
    while let Some(parent) = current {
        out.push(parent);
        current = PARENTS[parent];
    }
    out
}

fn is_descendant(candidate: usize, of: usize) -> bool {
    ancestors(candidate).contains(&of)
}

fn expected(muted: &[bool; TRACKS], soloed: &[bool; TRACKS]) -> [bool; TRACKS] {
    let any_soloed = soloed.iter().any(|s| *s);
    std::array::from_fn(|i| {
        let muted_here = muted[i] || ancestors(i).iter().any(|a| muted[*a]);
        let reachable = soloed[i]
            || ancestors(i).iter().any(|a| soloed[*a])
            || (0..TRACKS).any(|j| soloed[j] && is_descendant(j, i));
        !muted_here && (!any_soloed || reachable)
    })
}

fn activations(session: &Session) -> [bool; TRACKS] {
    std::array::from_fn(|i| session.registry.is_active(session.tracks[i]).unwrap())
}

/// Remote `active` control of a track's output stage
fn remote_active(session: &Session, track: NodeId) -> f32 {
    let stage = session
        .registry
        .with_tree(|tree| tree.stage(track, StageKind::TrackOutput))
        .unwrap();
    let handle = session.registry.handle(stage).unwrap();
    session.engine.control(handle, "active").unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════
// PROPERTIES
// ═══════════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn activation_matches_formula(
        muted in prop::array::uniform5(any::<bool>()),
        soloed in prop::array::uniform5(any::<bool>()),
        solo_first in any::<bool>(),
    ) {
        let session = session();
        let apply_mutes = |s: &Session| {
            for (i, m) in muted.iter().enumerate() {
                if *m {
                    s.registry.mute(s.tracks[i]).unwrap();
                }
            }
        };
        let apply_solos = |s: &Session| {
            for (i, on) in soloed.iter().enumerate() {
                if *on {
                    s.registry.solo(s.tracks[i], false).unwrap();
                }
            }
        };
        if solo_first {
            apply_solos(&session);
            apply_mutes(&session);
        } else {
            apply_mutes(&session);
            apply_solos(&session);
        }

        let want = expected(&muted, &soloed);
        let got = activations(&session);
        prop_assert_eq!(got, want);
        for (i, track) in session.tracks.iter().enumerate() {
            let remote = remote_active(&session, *track);
            prop_assert_eq!(remote, if want[i] { 1.0 } else { 0.0 });
        }
    }

    #[test]
    fn unmute_and_unsolo_restore_everything(
        muted in prop::array::uniform5(any::<bool>()),
        soloed in prop::array::uniform5(any::<bool>()),
    ) {
        let session = session();
        for i in 0..TRACKS {
            if muted[i] {
                session.registry.mute(session.tracks[i]).unwrap();
            }
            if soloed[i] {
                session.registry.solo(session.tracks[i], false).unwrap();
            }
        }
        for i in (0..TRACKS).rev() {
            session.registry.unmute(session.tracks[i]).unwrap();
            session.registry.unsolo(session.tracks[i]).unwrap();
        }
        prop_assert_eq!(activations(&session), [true; TRACKS]);
    }

    #[test]
    fn exclusive_solo_equals_unsolo_then_solo(
        soloed in prop::array::uniform5(any::<bool>()),
        target in 0..TRACKS,
    ) {
        let exclusive = session();
        let manual = session();
        for s in [&exclusive, &manual] {
            for (i, on) in soloed.iter().enumerate() {
                if *on {
                    s.registry.solo(s.tracks[i], false).unwrap();
                }
            }
        }

        exclusive.registry.solo(exclusive.tracks[target], true).unwrap();
        for i in 0..TRACKS {
            if soloed[i] && i != target {
                manual.registry.unsolo(manual.tracks[i]).unwrap();
            }
        }
        manual.registry.solo(manual.tracks[target], false).unwrap();

        prop_assert_eq!(activations(&exclusive), activations(&manual));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EXAMPLES
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_mute_under_muted_group_sends_nothing() {
    let session = session();
    let [_, g, b, _, _] = session.tracks;
    session.registry.mute(g).unwrap();
    session.engine.clear_traffic();
    let diff = session.registry.mute(b).unwrap();
    assert!(diff.is_empty());
    assert!(session.engine.traffic().is_empty());
    assert!(session.registry.track_info(b).unwrap().is_muted);
}

#[test]
fn test_solo_reports_changes() {
    let session = session();
    let [a, g, b, c, d] = session.tracks;
    let diff = session.registry.solo(d, false).unwrap();
    // a and b fall silent; d's ancestors stay audible
    assert_eq!(diff.len(), 2);
    assert_eq!(diff.get(a), Some(false));
    assert_eq!(diff.get(b), Some(false));
    for track in [g, c, d] {
        assert!(session.registry.is_active(track).unwrap());
    }
}

#[test]
fn test_send_follows_source_activation() {
    let session = session();
    let a = session.tracks[0];
    let send = session.registry.sends(a, true).unwrap()[0];
    session.registry.mute(a).unwrap();
    let handle = session.registry.handle(send).unwrap();
    assert_eq!(session.engine.control(handle, "active"), Some(0.0));
    session.registry.unmute(a).unwrap();
    assert_eq!(session.engine.control(handle, "active"), Some(1.0));
}
