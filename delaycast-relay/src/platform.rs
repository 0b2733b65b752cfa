//! Seams to the external real-time media platform
//!
//! The relay never speaks to the SFU directly. It needs three things from
//! the platform:
//!
//! - **`RoomControl`**: server-side roster introspection and per-viewer
//!   subscription toggling (see [`crate::RoomServiceClient`])
//! - **`SessionConnector`**: joining a room as the synthetic participant,
//!   which yields a [`RelaySession`] plus its event stream
//! - **`LocalTrack`**: a published relay track that accepts raw frames
//!
//! Session connectivity is provided by the embedding application's real-time
//! SDK binding.

use crate::error::Result;
use crate::media::{MediaFrame, MediaKind, TrackShape};
use crate::types::{ParticipantIdentity, ParticipantRole, RoomId, TrackId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A track published by a participant, as listed by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub sid: TrackId,
    pub kind: MediaKind,
}

/// Roster entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub identity: ParticipantIdentity,
    pub role: ParticipantRole,
    pub tracks: Vec<TrackInfo>,
}

impl ParticipantInfo {
    #[must_use]
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.tracks.iter().map(|t| t.sid.clone()).collect()
    }
}

/// Server-side room administration
#[async_trait]
pub trait RoomControl: Send + Sync {
    /// Current participants of a room with their published tracks
    async fn list_participants(&self, room: &RoomId) -> Result<Vec<ParticipantInfo>>;

    /// Subscribe or unsubscribe `viewer` to/from the given tracks
    async fn update_subscriptions(
        &self,
        room: &RoomId,
        viewer: &ParticipantIdentity,
        track_ids: &[TrackId],
        subscribe: bool,
    ) -> Result<()>;
}

/// Events delivered to a relay session, in platform order
#[derive(Debug)]
pub enum SessionEvent {
    /// A remote track is now flowing into this session
    TrackSubscribed {
        participant: ParticipantIdentity,
        track: TrackId,
        kind: MediaKind,
        frames: mpsc::Receiver<MediaFrame>,
    },
    TrackUnsubscribed {
        participant: ParticipantIdentity,
        track: TrackId,
    },
    TrackPublished {
        participant: ParticipantIdentity,
        track: TrackId,
        kind: MediaKind,
    },
    TrackUnpublished {
        participant: ParticipantIdentity,
        track: TrackId,
    },
    ParticipantConnected {
        participant: ParticipantIdentity,
        role: ParticipantRole,
    },
    ParticipantDisconnected {
        participant: ParticipantIdentity,
    },
    /// The session itself was dropped by the platform
    Disconnected {
        reason: String,
    },
}

/// A joined session: the handle plus its event stream
pub struct SessionHandle {
    pub session: Arc<dyn RelaySession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Joins rooms as a synthetic participant
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        room: &RoomId,
        identity: &ParticipantIdentity,
        token: &str,
    ) -> Result<SessionHandle>;
}

/// A connected synthetic participant
#[async_trait]
pub trait RelaySession: Send + Sync {
    /// Publish a local track with a fixed shape
    async fn publish_track(&self, shape: TrackShape) -> Result<Arc<dyn LocalTrack>>;

    /// Leave the room and release platform resources
    async fn close(&self);
}

/// A published relay track
#[async_trait]
pub trait LocalTrack: Send + Sync {
    /// Platform handle of the published track
    fn sid(&self) -> TrackId;

    /// Push one raw frame into the track
    async fn capture(&self, frame: MediaFrame) -> Result<()>;
}
