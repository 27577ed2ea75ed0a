// Integration tests for the telephony bridge: pacing, silence degradation
// on room loss, automatic recovery, and buffered room handover.
//
// Time is paused and advanced one 20 ms frame at a time, with the fabric
// ticked manually, so every assertion is deterministic.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use openair_studio::audio::frame::{FABRIC_FRAME_SAMPLES, TELEPHONY_FRAME_SAMPLES};
use openair_studio::bridge::{decode_pcm, BridgeConfig, BridgeSession, MediaMessage};
use openair_studio::fabric::{ConferencingFabric, LocalFabric, SubscriptionPoll};

/// Advance one frame interval and let the bridge loop run.
async fn step() {
    tokio::time::advance(Duration::from_millis(20)).await;
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

fn drain_phone(rx: &mut mpsc::Receiver<MediaMessage>) -> Vec<Vec<i16>> {
    let mut frames = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let MediaMessage::Media { payload } = msg {
            frames.push(decode_pcm(&payload).unwrap());
        }
    }
    frames
}

fn is_silent(frame: &[i16]) -> bool {
    frame.iter().all(|&s| s == 0)
}

async fn bridge_setup(room: &str) -> (Arc<LocalFabric>, Arc<BridgeSession>, mpsc::Receiver<MediaMessage>) {
    let fabric = Arc::new(LocalFabric::new());
    fabric.ensure_room(room).await.unwrap();
    let fabric_dyn: Arc<dyn ConferencingFabric> = fabric.clone();

    let (events_tx, _events_rx) = mpsc::channel(64);
    let bridge = BridgeSession::connect(
        Uuid::new_v4(),
        "caller-x",
        fabric_dyn,
        room,
        events_tx,
        BridgeConfig::default(),
    )
    .await;

    let (tx, rx) = mpsc::channel(256);
    bridge.attach_phone(tx);

    (fabric, bridge, rx)
}

#[tokio::test(start_paused = true)]
async fn outbound_paces_room_audio_to_the_phone() {
    let (fabric, bridge, mut rx) = bridge_setup("onair").await;
    let peer = fabric.publish("onair", "peer").await.unwrap();

    let mut heard_audio = false;
    for _ in 0..6 {
        peer.publish(vec![4000i16; FABRIC_FRAME_SAMPLES]);
        fabric.tick_once();
        step().await;
        for frame in drain_phone(&mut rx) {
            assert_eq!(frame.len(), TELEPHONY_FRAME_SAMPLES);
            if !is_silent(&frame) {
                heard_audio = true;
                // Downsampled audio preserves the rough amplitude.
                assert!(frame.iter().any(|&s| s > 3000));
            }
        }
    }

    assert!(heard_audio, "room audio never reached the phone");
    assert!(!bridge.is_degraded());
    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lost_room_degrades_to_silence_and_recovers() {
    let (fabric, bridge, mut rx) = bridge_setup("onair").await;
    let peer = fabric.publish("onair", "peer").await.unwrap();

    // Warm: audio flows.
    for _ in 0..4 {
        peer.publish(vec![4000i16; FABRIC_FRAME_SAMPLES]);
        fabric.tick_once();
        step().await;
    }
    assert!(drain_phone(&mut rx).iter().any(|f| !is_silent(f)));

    // The room subscription dies mid-call.
    fabric.drop_subscriptions("onair");

    // Within one frame interval (plus at most the single buffered frame)
    // the outbound path is silence, and the call is still up.
    peer.publish(vec![4000i16; FABRIC_FRAME_SAMPLES]);
    fabric.tick_once();
    step().await;
    step().await;
    drain_phone(&mut rx);

    for _ in 0..3 {
        peer.publish(vec![4000i16; FABRIC_FRAME_SAMPLES]);
        fabric.tick_once();
        step().await;
        let frames = drain_phone(&mut rx);
        assert!(!frames.is_empty(), "pacing must continue while degraded");
        assert!(
            frames.iter().all(|f| is_silent(f)),
            "degraded outbound must be silence"
        );
    }
    assert!(bridge.is_degraded());
    assert!(bridge.is_running(), "a room fault must never end the call");
    assert!(bridge.phone_connected());

    // Recovery per the backoff schedule, no manual intervention.
    let mut recovered = false;
    for _ in 0..20 {
        peer.publish(vec![4000i16; FABRIC_FRAME_SAMPLES]);
        fabric.tick_once();
        step().await;
        if drain_phone(&mut rx).iter().any(|f| !is_silent(f)) {
            recovered = true;
            break;
        }
    }

    assert!(recovered, "bridge never resubscribed after room recovery");
    assert!(!bridge.is_degraded());
    assert!(bridge.is_running());
    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reassignment_moves_rooms_without_dropping_the_leg() {
    let (fabric, bridge, mut rx) = bridge_setup("screen-1").await;
    fabric.ensure_room("onair").await.unwrap();

    let screen_peer = fabric.publish("screen-1", "screener").await.unwrap();
    for _ in 0..3 {
        screen_peer.publish(vec![3000i16; FABRIC_FRAME_SAMPLES]);
        fabric.tick_once();
        step().await;
    }
    drain_phone(&mut rx);

    bridge.reassign("onair").await.unwrap();
    assert_eq!(bridge.current_room(), "onair");

    // Membership follows the reassignment exactly.
    assert!(fabric.members("onair").await.unwrap().contains(&"caller-x".to_string()));
    assert!(!fabric.members("screen-1").await.unwrap().contains(&"caller-x".to_string()));

    // Audio from the new room flows; the pacing never stopped.
    let host = fabric.publish("onair", "host").await.unwrap();
    let mut heard = false;
    for _ in 0..6 {
        host.publish(vec![4000i16; FABRIC_FRAME_SAMPLES]);
        fabric.tick_once();
        step().await;
        if drain_phone(&mut rx).iter().any(|f| !is_silent(f)) {
            heard = true;
            break;
        }
    }
    assert!(heard);
    assert!(bridge.is_running());
    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn muted_leg_publishes_silence_but_keeps_its_track() {
    let (fabric, bridge, _rx) = bridge_setup("onair").await;

    let mut listener = fabric.subscribe_mix_minus("onair", "listener").await.unwrap();

    // Unmuted inbound audio reaches the room.
    bridge.set_muted(false);
    bridge.feed_inbound(&vec![2000i16; TELEPHONY_FRAME_SAMPLES]);
    fabric.tick_once();
    match listener.poll_frame() {
        SubscriptionPoll::Frame(f) => assert!(!is_silent(&f)),
        _ => panic!("expected caller audio"),
    }

    // Muted inbound audio is silence, but the track (and membership) stays.
    bridge.set_muted(true);
    bridge.feed_inbound(&vec![2000i16; TELEPHONY_FRAME_SAMPLES]);
    fabric.tick_once();
    match listener.poll_frame() {
        SubscriptionPoll::Frame(f) => assert!(is_silent(&f)),
        _ => panic!("expected a silence frame"),
    }
    assert!(fabric.members("onair").await.unwrap().contains(&"caller-x".to_string()));

    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_idempotent_and_withdraws_the_track() {
    let (fabric, bridge, _rx) = bridge_setup("lobby").await;

    assert!(fabric.members("lobby").await.unwrap().contains(&"caller-x".to_string()));

    bridge.shutdown().await;
    bridge.shutdown().await;

    assert!(!bridge.is_running());
    assert!(!fabric.members("lobby").await.unwrap().contains(&"caller-x".to_string()));

    // A dead bridge ignores late media.
    bridge.feed_inbound(&vec![2000i16; TELEPHONY_FRAME_SAMPLES]);
    fabric.tick_once();
}
