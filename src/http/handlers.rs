use super::state::AppState;
use crate::bridge::{decode_pcm, MediaMessage};
use crate::calls::{Episode, EpisodeStore, LifecycleError};
use crate::fabric::ConferencingFabric;
use crate::telephony::{verify_signature, CallInstruction};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SIGNATURE_HEADER: &str = "x-studio-signature";

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct VoiceWebhook {
    pub event: String,
    pub call_ref: String,
    pub from: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusWebhook {
    pub event: String,
    pub call_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct ConferenceWebhook {
    pub event: String,
    pub room: String,
    #[serde(default)]
    pub identity: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PickUpRequest {
    pub screener: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ApproveRequest {
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartEpisodeRequest {
    pub episode_id: String,
}

#[derive(Debug, Deserialize)]
pub struct VolumeRequest {
    pub volume: u8,
}

#[derive(Debug, Deserialize)]
pub struct MuteRequest {
    pub muted: bool,
}

#[derive(Debug, Deserialize)]
pub struct PlayAssetRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct LevelsResponse {
    pub master: u8,
    pub sources: std::collections::HashMap<String, u8>,
}

#[derive(Debug, Serialize)]
pub struct RecordingResponse {
    pub bytes: usize,
    /// Finalized WAV payload for the storage collaborator.
    pub payload: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn lifecycle_error(e: LifecycleError) -> axum::response::Response {
    let status = match &e {
        LifecycleError::UnknownParticipant { .. } => StatusCode::NOT_FOUND,
        LifecycleError::InvalidTransition { .. } => StatusCode::CONFLICT,
        LifecycleError::AlreadyScreening { .. } => StatusCode::CONFLICT,
        LifecycleError::NoLiveEpisode { .. } => StatusCode::SERVICE_UNAVAILABLE,
        LifecycleError::ResourceBusy { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

fn check_signature(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), axum::response::Response> {
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !verify_signature(&state.webhook_secret, body, provided) {
        warn!("Rejected webhook with bad signature");
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "invalid signature".to_string(),
            }),
        )
            .into_response());
    }
    Ok(())
}

// ============================================================================
// Telephony webhooks
// ============================================================================

/// POST /telephony/voice
/// Inbound call signaling; responds with the next call instruction.
pub async fn voice_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Err(resp) = check_signature(&state, &headers, &body) {
        return resp;
    }

    let webhook: VoiceWebhook = match serde_json::from_slice(&body) {
        Ok(w) => w,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("malformed voice webhook: {}", e),
                }),
            )
                .into_response()
        }
    };

    if webhook.event != "ring" {
        debug!("Ignoring voice event {}", webhook.event);
        return (StatusCode::OK, Json(CallInstruction::Hangup)).into_response();
    }

    info!("Inbound call {} from {}", webhook.call_ref, webhook.from);

    let id = match state.director.admit(&webhook.from).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Admission failed for {}: {}", webhook.from, e);
            return (StatusCode::OK, Json(CallInstruction::Hangup)).into_response();
        }
    };

    state
        .call_index
        .write()
        .await
        .insert(webhook.call_ref.clone(), id);

    let participant = state.director.participant(id).await;
    let (room, token) = match participant {
        Some(p) => {
            let room = p.room.clone().unwrap_or_default();
            let token = state
                .rooms
                .issue_token(&room, &p.identity(), &["publish".to_string()])
                .await
                .map(|t| t.token)
                .ok();
            (room, token)
        }
        None => (String::new(), None),
    };

    (
        StatusCode::OK,
        Json(CallInstruction::DialConference {
            room,
            token,
            hold_audio: None,
        }),
    )
        .into_response()
}

/// POST /telephony/status
/// Call status callbacks; a hangup drives the participant to completed.
pub async fn status_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Err(resp) = check_signature(&state, &headers, &body) {
        return resp;
    }

    let webhook: StatusWebhook = match serde_json::from_slice(&body) {
        Ok(w) => w,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("malformed status webhook: {}", e),
                }),
            )
                .into_response()
        }
    };

    if matches!(webhook.event.as_str(), "hangup" | "completed" | "failed") {
        let id = state.call_index.write().await.remove(&webhook.call_ref);
        if let Some(id) = id {
            info!("Call {} ended ({}), completing {}", webhook.call_ref, webhook.event, id);
            if let Err(e) = state.director.complete(id).await {
                error!("Completion for {} failed: {}", id, e);
            }
        } else {
            debug!("Status for unknown call {} ignored", webhook.call_ref);
        }
    }

    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

/// POST /telephony/conference
/// Conference membership callbacks (join/leave/end), a second eventually
/// consistent source beside the fabric's own event stream.
pub async fn conference_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Err(resp) = check_signature(&state, &headers, &body) {
        return resp;
    }

    let webhook: ConferenceWebhook = match serde_json::from_slice(&body) {
        Ok(w) => w,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("malformed conference webhook: {}", e),
                }),
            )
                .into_response()
        }
    };

    match webhook.event.as_str() {
        "participant-join" => {
            if let Some(identity) = webhook.identity {
                state.rooms.apply_membership(&webhook.room, &identity, true).await;
            }
        }
        "participant-leave" => {
            if let Some(identity) = webhook.identity {
                state.rooms.apply_membership(&webhook.room, &identity, false).await;
            }
        }
        "conference-end" => {
            if let Err(e) = state.rooms.destroy_room(&webhook.room).await {
                warn!("Conference-end destroy of {} failed: {}", webhook.room, e);
            }
        }
        other => debug!("Ignoring conference event {}", other),
    }

    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

// ============================================================================
// Media frame channel
// ============================================================================

/// GET /media/:participant_id
/// The persistent bidirectional media socket for one call leg.
pub async fn media_channel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match state.director.bridge(id).await {
        Some(_) => ws
            .on_upgrade(move |socket| run_media_channel(socket, state, id))
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no active bridge for participant {}", id),
            }),
        )
            .into_response(),
    }
}

async fn run_media_channel(socket: WebSocket, state: AppState, id: Uuid) {
    let Some(bridge) = state.director.bridge(id).await else {
        return;
    };

    let (mut sink, mut stream) = socket.split();

    // Outbound: paced frames from the bridge toward the phone.
    let (tx, mut rx) = mpsc::channel::<MediaMessage>(8);
    bridge.attach_phone(tx);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    info!("Media channel open for participant {}", id);

    // Inbound: framed control messages from the phone network.
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<MediaMessage>(&text) {
                Ok(MediaMessage::Start { call_ref }) => {
                    debug!("Media stream started for call {}", call_ref);
                }
                Ok(MediaMessage::Media { payload }) => match decode_pcm(&payload) {
                    Ok(samples) => bridge.feed_inbound(&samples),
                    Err(e) => debug!("Undecodable media frame dropped: {}", e),
                },
                Ok(MediaMessage::Stop) => {
                    debug!("Media stream stopped for {}", id);
                    break;
                }
                Err(e) => debug!("Unparseable media message ignored: {}", e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();

    // A closed media channel is a hard phone disconnect: the participant
    // goes straight to completed (audio-graph detach runs inside).
    info!("Media channel closed for participant {}", id);
    if let Err(e) = state.director.complete(id).await {
        debug!("Completion after media close: {}", e);
    }
}

// ============================================================================
// Screener / host controls
// ============================================================================

/// POST /participants/:id/pickup
pub async fn pick_up(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PickUpRequest>,
) -> impl IntoResponse {
    match state.director.pick_up(id, &req.screener).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// POST /participants/:id/approve
pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApproveRequest>,
) -> impl IntoResponse {
    match state.director.approve(id, req.notes).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// POST /participants/:id/rescreen
pub async fn rescreen(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.director.rescreen(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// POST /participants/:id/onair
pub async fn put_on_air(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.director.put_on_air(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// POST /participants/:id/hold
pub async fn put_on_hold(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.director.put_on_hold(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// POST /participants/:id/complete
pub async fn complete(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.director.complete(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// POST /participants/:id/reject
pub async fn reject(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.director.reject(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => lifecycle_error(e),
    }
}

/// GET /participants
pub async fn list_participants(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.director.participants_snapshot().await;
    (StatusCode::OK, Json(snapshot)).into_response()
}

/// GET /participants/:id
pub async fn get_participant(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.director.participant(id).await {
        Some(p) => (StatusCode::OK, Json(p)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("participant {} not found", id),
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Episodes
// ============================================================================

/// POST /episodes/start
///
/// Marks the episode live, wires the on-air room into the host's mix
/// (mix-minus the host), and starts forwarding the master bus into the
/// room so bridged callers hear the broadcast.
pub async fn start_episode(
    State(state): State<AppState>,
    Json(req): Json<StartEpisodeRequest>,
) -> impl IntoResponse {
    let episode = Episode::new(req.episode_id);

    if let Err(e) = state
        .rooms
        .create_room(&episode.onair_room, crate::rooms::RoomClass::OnAir)
        .await
    {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: format!("on-air room unavailable: {}", e),
            }),
        )
            .into_response();
    }

    state.episodes.set_current(Some(episode.clone())).await;

    state.mixer.detach_source(super::state::ONAIR_SOURCE);
    if let Err(e) = state
        .mixer
        .attach_room_subscription(
            super::state::ONAIR_SOURCE,
            Arc::clone(&state.fabric),
            &episode.onair_room,
            super::state::HOST_IDENTITY,
        )
        .await
    {
        warn!("On-air room subscription failed (will reconcile): {}", e);
    }

    match state
        .fabric
        .publish(&episode.onair_room, super::state::HOST_IDENTITY)
        .await
    {
        Ok(publisher) => {
            let mut master = state.mixer.add_sink("onair-room", 8);
            let task = tokio::spawn(async move {
                while let Some(frame) = master.recv().await {
                    publisher.publish(frame.samples);
                }
            });
            *state.relay_task.lock().await = Some(task);
        }
        Err(e) => warn!("Host publication into on-air room failed: {}", e),
    }

    info!("Episode {} is live", episode.id);
    (StatusCode::OK, Json(episode)).into_response()
}

/// POST /episodes/end
/// Ends the live episode and completes every remaining participant.
pub async fn end_episode(State(state): State<AppState>) -> impl IntoResponse {
    let episode = state.episodes.current().await;
    state.episodes.set_current(None).await;

    for p in state.director.participants_snapshot().await {
        if !p.is_terminal() {
            if let Err(e) = state.director.complete(p.id).await {
                warn!("End-of-episode completion for {} failed: {}", p.id, e);
            }
        }
    }

    if let Some(task) = state.relay_task.lock().await.take() {
        task.abort();
    }
    state.mixer.detach_source(super::state::ONAIR_SOURCE);

    if let Some(episode) = episode {
        if let Err(e) = state
            .fabric
            .unpublish(&episode.onair_room, super::state::HOST_IDENTITY)
            .await
        {
            debug!("Host unpublish at episode end: {}", e);
        }
        if let Err(e) = state.rooms.destroy_room(&episode.onair_room).await {
            warn!("On-air room cleanup failed: {}", e);
        }
        if let Err(e) = state.rooms.destroy_room(&episode.lobby_room).await {
            warn!("Lobby cleanup failed: {}", e);
        }
        info!("Episode {} ended", episode.id);
    }

    (StatusCode::OK, Json(serde_json::json!({"status": "ended"}))).into_response()
}

// ============================================================================
// Mixer controls
// ============================================================================

/// POST /mixer/sources/:id/volume
pub async fn set_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<VolumeRequest>,
) -> impl IntoResponse {
    match state.mixer.set_volume(&id, req.volume) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// POST /mixer/sources/:id/mute
pub async fn set_muted(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MuteRequest>,
) -> impl IntoResponse {
    match state.mixer.set_muted(&id, req.muted) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// GET /mixer/levels
pub async fn levels(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(LevelsResponse {
            master: state.mixer.master_level(),
            sources: state.mixer.levels(),
        }),
    )
        .into_response()
}

/// POST /mixer/assets/play
pub async fn play_asset(
    State(state): State<AppState>,
    Json(req): Json<PlayAssetRequest>,
) -> impl IntoResponse {
    match state.assets.play(&req.url).await {
        Ok(playback) => {
            // Completion is observable but not awaited here; surface
            // failures in the log.
            let url = req.url.clone();
            tokio::spawn(async move {
                if let Err(e) = playback.wait().await {
                    warn!("Asset {} did not finish: {}", url, e);
                }
            });
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// POST /mixer/recording/start
pub async fn start_recording(State(state): State<AppState>) -> impl IntoResponse {
    match state.mixer.start_recording() {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// POST /mixer/recording/stop
/// Returns the finalized recording payload for the storage collaborator.
pub async fn stop_recording(State(state): State<AppState>) -> impl IntoResponse {
    match state.mixer.stop_recording() {
        Ok(bytes) => (
            StatusCode::OK,
            Json(RecordingResponse {
                bytes: bytes.len(),
                payload: base64::engine::general_purpose::STANDARD.encode(bytes),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
