//! Recording platform doubles for relay tests
//!
//! Available to other crates through the `test-util` feature.

use crate::config::RelayConfig;
use crate::credentials::AccessTokenIssuer;
use crate::error::{Error, Result};
use crate::media::{AudioFrame, MediaFrame, MediaKind, PixelFormat, TrackShape, VideoFrame};
use crate::platform::{
    LocalTrack, ParticipantInfo, RelaySession, RoomControl, SessionConnector, SessionEvent, SessionHandle,
    TrackInfo,
};
use crate::relay::RelayContext;
use crate::types::{ParticipantIdentity, ParticipantRole, RoomId, TrackId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Let spawned tasks run until they block on something external
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// 10 ms of mono 48 kHz audio filled with `fill`
pub fn audio_frame(fill: u8, samples_per_channel: u32) -> MediaFrame {
    MediaFrame::Audio(AudioFrame {
        data: Bytes::from(vec![fill; samples_per_channel as usize * 2]),
        sample_rate: 48_000,
        num_channels: 1,
        samples_per_channel,
    })
}

/// An RGBA picture filled with `fill`
pub fn video_frame(fill: u8, width: u32, height: u32) -> MediaFrame {
    MediaFrame::Video(VideoFrame {
        data: Bytes::from(vec![fill; (width * height * 4) as usize]),
        width,
        height,
        format: PixelFormat::Rgba,
        timestamp_us: 0,
    })
}

/// One recorded subscription toggle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleCall {
    pub viewer: ParticipantIdentity,
    pub track_ids: Vec<TrackId>,
    pub subscribe: bool,
}

/// In-memory room roster that records every subscription toggle
#[derive(Default)]
pub struct MockRoomControl {
    roster: Mutex<Vec<ParticipantInfo>>,
    calls: Mutex<Vec<ToggleCall>>,
    failing_viewers: Mutex<HashSet<ParticipantIdentity>>,
    listing_fails: AtomicBool,
}

impl MockRoomControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_participant(&self, identity: &str, role: ParticipantRole, tracks: &[(&str, MediaKind)]) {
        self.roster.lock().push(ParticipantInfo {
            identity: ParticipantIdentity::from(identity),
            role,
            tracks: to_tracks(tracks),
        });
    }

    pub fn remove_participant(&self, identity: &str) {
        self.roster.lock().retain(|p| p.identity.as_str() != identity);
    }

    pub fn set_tracks(&self, identity: &str, tracks: &[(&str, MediaKind)]) {
        if let Some(p) = self.roster.lock().iter_mut().find(|p| p.identity.as_str() == identity) {
            p.tracks = to_tracks(tracks);
        }
    }

    pub fn fail_viewer(&self, identity: &str) {
        self.failing_viewers.lock().insert(ParticipantIdentity::from(identity));
    }

    pub fn set_listing_fails(&self, fails: bool) {
        self.listing_fails.store(fails, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ToggleCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, viewer: &str) -> Vec<ToggleCall> {
        self.calls.lock().iter().filter(|c| c.viewer.as_str() == viewer).cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

fn to_tracks(tracks: &[(&str, MediaKind)]) -> Vec<TrackInfo> {
    tracks
        .iter()
        .map(|(sid, kind)| TrackInfo {
            sid: TrackId::from(*sid),
            kind: *kind,
        })
        .collect()
}

#[async_trait]
impl RoomControl for MockRoomControl {
    async fn list_participants(&self, _room: &RoomId) -> Result<Vec<ParticipantInfo>> {
        if self.listing_fails.load(Ordering::SeqCst) {
            return Err(Error::Platform("listing unavailable".to_string()));
        }
        Ok(self.roster.lock().clone())
    }

    async fn update_subscriptions(
        &self,
        _room: &RoomId,
        viewer: &ParticipantIdentity,
        track_ids: &[TrackId],
        subscribe: bool,
    ) -> Result<()> {
        self.calls.lock().push(ToggleCall {
            viewer: viewer.clone(),
            track_ids: track_ids.to_vec(),
            subscribe,
        });
        if self.failing_viewers.lock().contains(viewer) {
            return Err(Error::Platform(format!("participant {viewer} not found")));
        }
        Ok(())
    }
}

/// A frame as it reached a mock track
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub at: Instant,
    pub frame: MediaFrame,
}

/// Published relay track recording its captures
pub struct MockTrack {
    sid: TrackId,
    pub shape: TrackShape,
    captured: Mutex<Vec<CapturedFrame>>,
    capture_fails: AtomicBool,
}

impl MockTrack {
    pub fn captured(&self) -> Vec<CapturedFrame> {
        self.captured.lock().clone()
    }

    pub fn capture_count(&self) -> usize {
        self.captured.lock().len()
    }

    pub fn set_capture_fails(&self, fails: bool) {
        self.capture_fails.store(fails, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocalTrack for MockTrack {
    fn sid(&self) -> TrackId {
        self.sid.clone()
    }

    async fn capture(&self, frame: MediaFrame) -> Result<()> {
        if self.capture_fails.load(Ordering::SeqCst) {
            return Err(Error::Capture("track closed".to_string()));
        }
        self.captured.lock().push(CapturedFrame { at: Instant::now(), frame });
        Ok(())
    }
}

/// Session of one synthetic participant
pub struct MockSession {
    pub identity: ParticipantIdentity,
    published: Mutex<Vec<Arc<MockTrack>>>,
    publish_fails: Mutex<HashSet<MediaKind>>,
    publish_stalls: Mutex<HashSet<MediaKind>>,
    closed: AtomicBool,
    capture_fails_on_publish: Mutex<HashSet<MediaKind>>,
}

impl MockSession {
    fn new(identity: ParticipantIdentity) -> Self {
        Self {
            identity,
            published: Mutex::new(Vec::new()),
            publish_fails: Mutex::new(HashSet::new()),
            publish_stalls: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            capture_fails_on_publish: Mutex::new(HashSet::new()),
        }
    }

    pub fn track(&self, kind: MediaKind) -> Option<Arc<MockTrack>> {
        self.published.lock().iter().find(|t| t.shape.kind() == kind).cloned()
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }

    pub fn captured(&self, kind: MediaKind) -> Vec<CapturedFrame> {
        self.track(kind).map(|t| t.captured()).unwrap_or_default()
    }

    pub fn fail_publish(&self, kind: MediaKind) {
        self.publish_fails.lock().insert(kind);
    }

    /// Publishing `kind` never completes
    pub fn stall_publish(&self, kind: MediaKind) {
        self.publish_stalls.lock().insert(kind);
    }

    /// Tracks of `kind` published from now on reject every capture
    pub fn fail_captures(&self, kind: MediaKind) {
        self.capture_fails_on_publish.lock().insert(kind);
        if let Some(track) = self.track(kind) {
            track.set_capture_fails(true);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelaySession for MockSession {
    async fn publish_track(&self, shape: TrackShape) -> Result<Arc<dyn LocalTrack>> {
        let kind = shape.kind();
        if self.publish_fails.lock().contains(&kind) {
            return Err(Error::Publish(format!("{} publish rejected", kind.as_str())));
        }
        if self.publish_stalls.lock().contains(&kind) {
            std::future::pending::<()>().await;
        }
        let mut published = self.published.lock();
        let track = Arc::new(MockTrack {
            sid: TrackId::new(format!("TR_{}_{}_{}", self.identity, kind.as_str(), published.len())),
            shape,
            captured: Mutex::new(Vec::new()),
            capture_fails: AtomicBool::new(self.capture_fails_on_publish.lock().contains(&kind)),
        });
        published.push(Arc::clone(&track));
        Ok(track)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out mock sessions and keeps their event senders
#[derive(Default)]
pub struct MockConnector {
    sessions: Mutex<HashMap<ParticipantIdentity, Arc<MockSession>>>,
    senders: Mutex<HashMap<ParticipantIdentity, mpsc::UnboundedSender<SessionEvent>>>,
    tokens: Mutex<Vec<String>>,
    connect_fails: AtomicBool,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_connect_fails(&self, fails: bool) {
        self.connect_fails.store(fails, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Latest session opened under `identity`
    pub fn session(&self, identity: &str) -> Option<Arc<MockSession>> {
        self.sessions.lock().get(&ParticipantIdentity::from(identity)).cloned()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    /// Deliver a platform event to the session of `identity`
    pub fn send(&self, identity: &str, event: SessionEvent) -> bool {
        self.senders
            .lock()
            .get(&ParticipantIdentity::from(identity))
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Subscribe the session of `relay` to a source track and return its frame feed
    pub fn subscribe_source(
        &self,
        relay: &str,
        source: &str,
        track: &str,
        kind: MediaKind,
    ) -> mpsc::Sender<MediaFrame> {
        let (tx, frames) = mpsc::channel(64);
        self.send(
            relay,
            SessionEvent::TrackSubscribed {
                participant: ParticipantIdentity::from(source),
                track: TrackId::from(track),
                kind,
                frames,
            },
        );
        tx
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(&self, _room: &RoomId, identity: &ParticipantIdentity, token: &str) -> Result<SessionHandle> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_fails.load(Ordering::SeqCst) {
            return Err(Error::Session("connection refused".to_string()));
        }

        let session = Arc::new(MockSession::new(identity.clone()));
        let (tx, events) = mpsc::unbounded_channel();
        self.sessions.lock().insert(identity.clone(), Arc::clone(&session));
        self.senders.lock().insert(identity.clone(), tx);
        self.tokens.lock().push(token.to_string());

        Ok(SessionHandle { session, events })
    }
}

/// Relay context wired to fresh mocks
pub fn test_context(config: RelayConfig) -> (RelayContext, Arc<MockRoomControl>, Arc<MockConnector>) {
    let control = MockRoomControl::new();
    let connector = MockConnector::new();
    let issuer = AccessTokenIssuer::new("APItest", "relay-test-secret-0123456789", config.credential_ttl_secs)
        .unwrap_or_else(|e| panic!("test issuer: {e}"));

    let ctx = RelayContext {
        config: Arc::new(config),
        issuer: Arc::new(issuer),
        connector: connector.clone(),
        control: control.clone(),
    };
    (ctx, control, connector)
}

/// `alice` publishing audio and video, watched by `bob` and `carol`, plus a recorder
pub fn stage_roster(control: &MockRoomControl) {
    control.add_participant(
        "alice",
        ParticipantRole::Source,
        &[("TR_alice_a", MediaKind::Audio), ("TR_alice_v", MediaKind::Video)],
    );
    control.add_participant("bob", ParticipantRole::Source, &[]);
    control.add_participant("carol", ParticipantRole::Source, &[]);
    control.add_participant("egress-rec", ParticipantRole::Service, &[]);
}
