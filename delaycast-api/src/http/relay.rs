//! Delay relay HTTP handlers
//!
//! Thin JSON wrappers over `RelayRegistry`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use delaycast_relay::{ParticipantIdentity, ParticipantInfo, RelaySnapshot, RoomId, SetDelayOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{AppError, AppResult, AppState};

/// Body of `PUT .../delay`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDelayRequest {
    pub delay_ms: u64,
    /// Keep a pass-through relay alive at zero delay
    #[serde(default)]
    pub keep_alive: bool,
}

/// Set the delay applied to `participant`
pub async fn set_delay(
    State(state): State<AppState>,
    Path((room, participant)): Path<(String, String)>,
    Json(req): Json<SetDelayRequest>,
) -> AppResult<Json<SetDelayOutcome>> {
    let outcome = state
        .registry
        .set_delay(
            RoomId::new(room),
            ParticipantIdentity::new(participant),
            req.delay_ms,
            req.keep_alive,
        )
        .await?;

    Ok(Json(outcome))
}

/// Tear down the relay for `participant`, if any
pub async fn clear_delay(
    State(state): State<AppState>,
    Path((room, participant)): Path<(String, String)>,
) -> StatusCode {
    state
        .registry
        .remove_relay(&RoomId::new(room), &ParticipantIdentity::new(participant))
        .await;
    StatusCode::NO_CONTENT
}

/// Delay of every active relay in a room
pub async fn get_delays(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> Json<BTreeMap<ParticipantIdentity, u64>> {
    Json(state.registry.status(&RoomId::new(room)))
}

pub async fn get_relay(
    State(state): State<AppState>,
    Path((room, participant)): Path<(String, String)>,
) -> AppResult<Json<RelaySnapshot>> {
    let room = RoomId::new(room);
    let participant = ParticipantIdentity::new(participant);

    state
        .registry
        .snapshot(&room, &participant)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("No relay for {participant} in {room}")))
}

/// Real participants in a room (relays and service participants are hidden)
pub async fn list_participants(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> AppResult<Json<Vec<ParticipantInfo>>> {
    let participants = state.registry.participants(&RoomId::new(room)).await?;
    Ok(Json(participants))
}
