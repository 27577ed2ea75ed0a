// Integration tests for the call/participant lifecycle state machine.
//
// These drive the director against the in-process fabric and verify the
// invariants the screening room depends on: states and room classes stay
// consistent, terminal events replay safely, and concurrent operations on
// one participant cannot race into an inconsistent state.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use openair_studio::audio::{MixerConfig, MixerGraph};
use openair_studio::calls::{
    CallDirector, CallerState, DirectorConfig, Episode, InMemoryEpisodeStore, LifecycleError,
    Reconciler, ReconcilerConfig,
};
use openair_studio::fabric::{ConferencingFabric, LocalFabric};
use openair_studio::notify::NullNotifier;
use openair_studio::rooms::{RoomClass, RoomManager, RoomManagerConfig};

struct Studio {
    director: Arc<CallDirector>,
    episodes: Arc<InMemoryEpisodeStore>,
    fabric: Arc<LocalFabric>,
    rooms: Arc<RoomManager>,
}

async fn studio() -> Studio {
    let fabric = Arc::new(LocalFabric::new());
    let fabric_dyn: Arc<dyn ConferencingFabric> = fabric.clone();
    let rooms = Arc::new(RoomManager::new(
        fabric_dyn.clone(),
        RoomManagerConfig::default(),
    ));
    let episodes = Arc::new(InMemoryEpisodeStore::new());
    let mixer = Arc::new(MixerGraph::new(MixerConfig::default()));

    let (director, bridge_events) = CallDirector::new(
        episodes.clone(),
        Arc::clone(&rooms),
        fabric_dyn,
        Arc::new(NullNotifier),
        mixer,
        DirectorConfig::default(),
    );
    tokio::spawn(Arc::clone(&rooms).run_bridge_events(bridge_events));

    Studio {
        director,
        episodes,
        fabric,
        rooms,
    }
}

async fn live_studio() -> Studio {
    let s = studio().await;
    s.episodes.set_current(Some(Episode::new("ep-1"))).await;
    s
}

// ----------------------------------------------------------------------
// Admission (Scenario A)
// ----------------------------------------------------------------------

#[tokio::test]
async fn admit_creates_queued_participant_in_lobby() {
    let s = live_studio().await;

    let id = s.director.admit("+15550001").await.unwrap();
    let p = s.director.participant(id).await.unwrap();

    assert_eq!(p.state, CallerState::Queued);
    assert_eq!(p.room.as_deref(), Some("lobby-ep-1"));
    assert!(p.muted);
    assert_eq!(s.rooms.class_of("lobby-ep-1").await, Some(RoomClass::Lobby));

    // The bridge exists and is attached to the lobby.
    let bridge = s.director.bridge(id).await.unwrap();
    assert!(bridge.is_running());
    assert_eq!(bridge.current_room(), "lobby-ep-1");
    let members = s.fabric.members("lobby-ep-1").await.unwrap();
    assert!(members.contains(&p.identity()));
}

#[tokio::test(start_paused = true)]
async fn admit_waits_for_lagging_episode_record() {
    let s = studio().await;

    // The business record lags signaling by 4.5 s, inside the 5 s window.
    let episodes = s.episodes.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(4500)).await;
        episodes.set_current(Some(Episode::new("ep-1"))).await;
    });

    let started = tokio::time::Instant::now();
    let id = s.director.admit("+15550002").await.unwrap();
    assert!(started.elapsed() <= Duration::from_secs(5));

    let p = s.director.participant(id).await.unwrap();
    assert_eq!(p.state, CallerState::Queued);
}

#[tokio::test(start_paused = true)]
async fn admit_abandons_call_when_no_episode_appears() {
    let s = studio().await;

    let err = s.director.admit("+15550003").await.unwrap_err();
    assert!(matches!(err, LifecycleError::NoLiveEpisode { .. }));
}

#[tokio::test]
async fn admit_force_completes_stale_record_for_same_caller() {
    let s = live_studio().await;

    let first = s.director.admit("+15550004").await.unwrap();
    let second = s.director.admit("+15550004").await.unwrap();
    assert_ne!(first, second);

    let stale = s.director.participant(first).await.unwrap();
    assert_eq!(stale.state, CallerState::Completed);
    assert!(stale.room.is_none());
    assert!(s.director.bridge(first).await.is_none());

    let fresh = s.director.participant(second).await.unwrap();
    assert_eq!(fresh.state, CallerState::Queued);
}

// ----------------------------------------------------------------------
// Screening (Scenario B)
// ----------------------------------------------------------------------

#[tokio::test]
async fn pick_up_moves_to_private_screening_room() {
    let s = live_studio().await;
    let id = s.director.admit("+15550005").await.unwrap();

    s.director.pick_up(id, "sam").await.unwrap();

    let p = s.director.participant(id).await.unwrap();
    assert_eq!(p.state, CallerState::Screening);
    let room = p.room.clone().unwrap();
    assert!(room.starts_with("screen-"));
    assert_eq!(s.rooms.class_of(&room).await, Some(RoomClass::Screening));
    // The screening conversation is two-way.
    assert!(!p.muted);
    assert!(!s.director.bridge(id).await.unwrap().is_muted());
}

#[tokio::test]
async fn screener_cannot_pick_up_two_calls() {
    let s = live_studio().await;
    let first = s.director.admit("+15550006").await.unwrap();
    let second = s.director.admit("+15550007").await.unwrap();

    s.director.pick_up(first, "sam").await.unwrap();

    let err = s.director.pick_up(second, "sam").await.unwrap_err();
    assert!(matches!(err, LifecycleError::AlreadyScreening { screener } if screener == "sam"));

    // The guard is per-screener, not global.
    s.director.pick_up(second, "alex").await.unwrap();

    // Finishing the first screening frees sam.
    s.director.approve(first, None).await.unwrap();
    let third = s.director.admit("+15550008").await.unwrap();
    s.director.pick_up(third, "sam").await.unwrap();
}

#[tokio::test]
async fn pick_up_requires_queued_state() {
    let s = live_studio().await;
    let id = s.director.admit("+15550009").await.unwrap();
    s.director.pick_up(id, "sam").await.unwrap();

    let err = s.director.pick_up(id, "alex").await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::InvalidTransition { action: "pick up", state: CallerState::Screening }
    ));
}

// ----------------------------------------------------------------------
// Hold / on-air (Scenario C)
// ----------------------------------------------------------------------

#[tokio::test]
async fn approve_parks_muted_in_onair_room() {
    let s = live_studio().await;
    let id = s.director.admit("+15550010").await.unwrap();
    s.director.pick_up(id, "sam").await.unwrap();

    s.director.approve(id, Some("wants to talk weather".into())).await.unwrap();

    let p = s.director.participant(id).await.unwrap();
    assert_eq!(p.state, CallerState::Hold);
    assert_eq!(p.room.as_deref(), Some("onair-ep-1"));
    assert!(p.muted, "caller hears the room but is not heard");
    assert_eq!(p.approval_notes.as_deref(), Some("wants to talk weather"));
    assert_eq!(s.rooms.class_of("onair-ep-1").await, Some(RoomClass::OnAir));

    // The per-participant screening room is gone.
    assert!(s.rooms.room(&format!("screen-{}", id)).await.is_none());
}

#[tokio::test]
async fn hold_onair_toggles_mute_without_rejoin() {
    let s = live_studio().await;
    let id = s.director.admit("+15550011").await.unwrap();
    s.director.pick_up(id, "sam").await.unwrap();
    s.director.approve(id, None).await.unwrap();

    let bridge = s.director.bridge(id).await.unwrap();
    let room_before = bridge.current_room();
    assert!(bridge.is_muted());

    let mut observed = vec![bridge.is_muted()];

    s.director.put_on_air(id).await.unwrap();
    observed.push(s.director.bridge(id).await.unwrap().is_muted());

    s.director.put_on_hold(id).await.unwrap();
    observed.push(s.director.bridge(id).await.unwrap().is_muted());

    s.director.put_on_air(id).await.unwrap();
    observed.push(s.director.bridge(id).await.unwrap().is_muted());

    assert_eq!(observed, vec![true, false, true, false]);

    // Same room the whole way through: no rejoin latency.
    let bridge = s.director.bridge(id).await.unwrap();
    assert_eq!(bridge.current_room(), room_before);
    let members = s.fabric.members(&room_before).await.unwrap();
    assert!(members.contains(&s.director.participant(id).await.unwrap().identity()));
}

#[tokio::test]
async fn rescreen_returns_held_caller_to_screener() {
    let s = live_studio().await;
    let id = s.director.admit("+15550012").await.unwrap();
    s.director.pick_up(id, "sam").await.unwrap();
    s.director.approve(id, None).await.unwrap();

    s.director.rescreen(id).await.unwrap();

    let p = s.director.participant(id).await.unwrap();
    assert_eq!(p.state, CallerState::Screening);
    assert_eq!(p.room.as_deref(), Some(format!("screen-{}", id).as_str()));
    assert!(!p.muted);
}

#[tokio::test]
async fn put_on_air_guards_invalid_states() {
    let s = live_studio().await;
    let id = s.director.admit("+15550013").await.unwrap();

    // Straight from queued is not a legal edge.
    let err = s.director.put_on_air(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidTransition { .. }));

    let ghost = Uuid::new_v4();
    let err = s.director.put_on_air(ghost).await.unwrap_err();
    assert!(matches!(err, LifecycleError::UnknownParticipant { .. }));
}

// ----------------------------------------------------------------------
// Terminal states
// ----------------------------------------------------------------------

#[tokio::test]
async fn terminal_replay_is_a_noop() {
    let s = live_studio().await;
    let id = s.director.admit("+15550014").await.unwrap();
    s.director.complete(id).await.unwrap();

    let after_first = s.director.participant(id).await.unwrap();

    // Duplicate hangups, rejections, whatever redelivery brings.
    for _ in 0..5 {
        s.director.complete(id).await.unwrap();
        s.director.reject(id).await.unwrap();
    }

    let after_replay = s.director.participant(id).await.unwrap();
    assert_eq!(after_replay.state, CallerState::Completed);
    assert_eq!(after_replay.history.len(), after_first.history.len());
    assert!(s.director.bridge(id).await.is_none());
}

#[tokio::test]
async fn terminate_releases_resources_in_order() {
    let s = live_studio().await;
    let id = s.director.admit("+15550015").await.unwrap();
    s.director.pick_up(id, "sam").await.unwrap();

    let bridge = s.director.bridge(id).await.unwrap();
    let room = bridge.current_room();
    let identity = s.director.participant(id).await.unwrap().identity();

    s.director.reject(id).await.unwrap();

    assert!(!bridge.is_running());
    assert!(s.director.bridge(id).await.is_none());

    // Left the room on the fabric.
    if let Ok(members) = s.fabric.members(&room).await {
        assert!(!members.contains(&identity));
    }

    let p = s.director.participant(id).await.unwrap();
    assert_eq!(p.state, CallerState::Rejected);
    assert!(p.room.is_none());

    // The screener is free again.
    let next = s.director.admit("+15550016").await.unwrap();
    s.director.pick_up(next, "sam").await.unwrap();
}

#[tokio::test]
async fn concurrent_approve_and_reject_yield_one_terminal_outcome() {
    for _ in 0..20 {
        let s = live_studio().await;
        let id = s.director.admit("+15550017").await.unwrap();
        s.director.pick_up(id, "sam").await.unwrap();

        let d1 = s.director.clone();
        let d2 = s.director.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { d1.approve(id, None).await }),
            tokio::spawn(async move { d2.reject(id).await }),
        );
        // Either interleaving is acceptable; neither may panic.
        let _ = a.unwrap();
        let _ = b.unwrap();

        let p = s.director.participant(id).await.unwrap();
        assert_eq!(p.state, CallerState::Rejected, "reject always wins eventually");
        assert!(p.room.is_none());
        assert!(s.director.bridge(id).await.is_none());

        // Membership matches the terminal outcome: the caller is in no room.
        let identity = p.identity();
        for room in ["lobby-ep-1", "onair-ep-1", &format!("screen-{}", id)] {
            if let Ok(members) = s.fabric.members(room).await {
                assert!(!members.contains(&identity), "{} still lists {}", room, identity);
            }
        }
    }
}

// ----------------------------------------------------------------------
// Random transition sequences
// ----------------------------------------------------------------------

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn pick(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

async fn assert_state_room_consistency(s: &Studio) {
    for p in s.director.participants_snapshot().await {
        match p.state {
            CallerState::Queued => {
                let room = p.room.as_deref().expect("queued participant must have a room");
                assert_eq!(s.rooms.class_of(room).await, Some(RoomClass::Lobby));
            }
            CallerState::Screening => {
                let room = p.room.as_deref().expect("screening participant must have a room");
                assert_eq!(s.rooms.class_of(room).await, Some(RoomClass::Screening));
            }
            CallerState::Hold | CallerState::OnAir => {
                let room = p.room.as_deref().expect("held participant must have a room");
                assert_eq!(s.rooms.class_of(room).await, Some(RoomClass::OnAir));
            }
            CallerState::Completed | CallerState::Rejected => {
                assert!(p.room.is_none(), "terminal participant kept a room");
            }
        }

        // Never a member of two rooms at once.
        let identity = p.identity();
        let mut candidate_rooms = vec!["lobby-ep-1".to_string(), "onair-ep-1".to_string()];
        for other in s.director.participants_snapshot().await {
            candidate_rooms.push(format!("screen-{}", other.id));
        }
        let mut memberships = 0;
        for room in candidate_rooms {
            if let Ok(members) = s.fabric.members(&room).await {
                if members.contains(&identity) {
                    memberships += 1;
                }
            }
        }
        assert!(
            memberships <= 1,
            "participant {} is in {} rooms",
            p.id,
            memberships
        );
        if p.is_terminal() {
            assert_eq!(memberships, 0);
        }
    }
}

#[tokio::test]
async fn random_transition_sequences_preserve_invariants() {
    let s = live_studio().await;
    let mut rng = Lcg(0x5eed_cafe);
    let screeners = ["sam", "alex", "pat"];
    let mut ids: Vec<Uuid> = Vec::new();

    for step in 0..200 {
        let op = rng.pick(8);
        match op {
            0 => {
                if ids.len() < 5 {
                    let caller = format!("+1555100{}", rng.pick(4));
                    if let Ok(id) = s.director.admit(&caller).await {
                        ids.push(id);
                    }
                    // Stale cleanup may have terminated an earlier record;
                    // that is part of the behavior under test.
                }
            }
            _ if ids.is_empty() => continue,
            1 => {
                let id = ids[rng.pick(ids.len())];
                let screener = screeners[rng.pick(screeners.len())];
                let _ = s.director.pick_up(id, screener).await;
            }
            2 => {
                let id = ids[rng.pick(ids.len())];
                let _ = s.director.approve(id, None).await;
            }
            3 => {
                let id = ids[rng.pick(ids.len())];
                let _ = s.director.rescreen(id).await;
            }
            4 => {
                let id = ids[rng.pick(ids.len())];
                let _ = s.director.put_on_air(id).await;
            }
            5 => {
                let id = ids[rng.pick(ids.len())];
                let _ = s.director.put_on_hold(id).await;
            }
            6 => {
                let id = ids[rng.pick(ids.len())];
                let _ = s.director.complete(id).await;
                ids.retain(|x| *x != id);
            }
            _ => {
                let id = ids[rng.pick(ids.len())];
                let _ = s.director.reject(id).await;
                ids.retain(|x| *x != id);
            }
        }

        if step % 10 == 0 {
            assert_state_room_consistency(&s).await;
        }
    }

    assert_state_room_consistency(&s).await;
}

// ----------------------------------------------------------------------
// Reconciliation
// ----------------------------------------------------------------------

#[tokio::test]
async fn reconciler_repairs_lost_room_attachment() {
    let s = live_studio().await;
    let id = s.director.admit("+15550020").await.unwrap();
    let identity = s.director.participant(id).await.unwrap().identity();

    // The room dies fabric-side; the bridge degrades but the call survives.
    s.fabric.close_room("lobby-ep-1").await.unwrap();

    let fabric_dyn: Arc<dyn ConferencingFabric> = s.fabric.clone();
    let mut reconciler = Reconciler::new(
        s.director.clone(),
        s.rooms.clone(),
        fabric_dyn,
        ReconcilerConfig::default(),
    );
    reconciler.reconcile_once().await;

    let members = s.fabric.members("lobby-ep-1").await.unwrap();
    assert!(members.contains(&identity), "repair should reattach the bridge");
    assert_eq!(reconciler.failure_count("lobby-ep-1"), 0);

    let bridge = s.director.bridge(id).await.unwrap();
    assert!(bridge.is_running());
}
