//! Delay relay
//!
//! A [`DelayRelay`] joins a room as a synthetic participant, subscribes to one
//! source participant and republishes that source's media after a
//! configurable delay.
//!
//! Each relay is driven by one supervisor task that consumes platform events
//! and queued subscription-policy changes in order. Every subscribed source
//! track gets its own [`FrameDelayPipeline`]. Frames are tagged with the
//! relay generation at arrival; any delay change or stop bumps the
//! generation, so stale frames are dropped at fire time.
//!
//! Emission (generation check, lazy track publish, capture) is serialized
//! per media kind through an async gate that [`DelayRelay::stop`] also passes
//! through, so no frame is captured after `stop` returns. Every platform call
//! made under a gate is raced against the relay's cancellation token, so a
//! stuck publish or capture of one kind neither starves the other kind nor
//! holds up teardown.

use crate::config::RelayConfig;
use crate::credentials::AccessTokenIssuer;
use crate::error::{Error, Result};
use crate::idle::{IdleKeepAlive, KeepAliveTarget};
use crate::media::{AudioFrame, AudioShape, MediaFrame, MediaKind, TrackShape, VideoFrame, VideoShape};
use crate::pipeline::{FrameDelayPipeline, FrameSink};
use crate::platform::{LocalTrack, RelaySession, RoomControl, SessionConnector, SessionEvent, SessionHandle};
use crate::subscription::SubscriptionController;
use crate::types::{ParticipantIdentity, ParticipantRole, RoomId, TrackId};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Upper bound on leaving the room during teardown
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a relay needs from its surroundings
#[derive(Clone)]
pub struct RelayContext {
    pub config: Arc<RelayConfig>,
    pub issuer: Arc<AccessTokenIssuer>,
    pub connector: Arc<dyn SessionConnector>,
    pub control: Arc<dyn RoomControl>,
}

/// Per-kind capture failure flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFailures {
    pub audio: bool,
    pub video: bool,
}

/// Point-in-time view of one relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySnapshot {
    pub room: RoomId,
    pub source: ParticipantIdentity,
    pub relay_identity: ParticipantIdentity,
    pub delay_ms: u64,
    pub generation: u64,
    pub running: bool,
    pub source_active: bool,
    pub idle_active: bool,
    /// Source tracks as of the last resync
    pub track_ids: Vec<TrackId>,
    /// Tracks published by the relay
    pub published: Vec<TrackId>,
    pub capture_failed: CaptureFailures,
    pub frames_received: u64,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub idle_frames: u64,
}

#[derive(Debug, Default)]
struct RelayCounters {
    received: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    idle: AtomicU64,
}

/// Published outputs and the shapes they were fixed with
#[derive(Default)]
struct Outputs {
    audio: Option<Arc<dyn LocalTrack>>,
    video: Option<Arc<dyn LocalTrack>>,
    audio_shape: Option<AudioShape>,
    video_shape: Option<VideoShape>,
    last_video: Option<VideoFrame>,
}

impl Outputs {
    fn track(&self, kind: MediaKind) -> Option<&Arc<dyn LocalTrack>> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    fn shape(&self, kind: MediaKind) -> Option<TrackShape> {
        match kind {
            MediaKind::Audio => self.audio_shape.map(TrackShape::Audio),
            MediaKind::Video => self.video_shape.map(TrackShape::Video),
        }
    }

    fn fix_shape(&mut self, shape: TrackShape) {
        match shape {
            TrackShape::Audio(s) => {
                self.audio_shape.get_or_insert(s);
            }
            TrackShape::Video(s) => {
                self.video_shape.get_or_insert(s);
            }
        }
    }

    fn set_track(&mut self, kind: MediaKind, track: Arc<dyn LocalTrack>) {
        match kind {
            MediaKind::Audio => self.audio = Some(track),
            MediaKind::Video => self.video = Some(track),
        }
    }

    fn published(&self) -> Vec<TrackId> {
        self.audio.iter().chain(self.video.iter()).map(|t| t.sid()).collect()
    }

    /// Next filler frame; a repeated picture advances its timestamp by `video_step`
    fn filler(&mut self, kind: MediaKind, video_step: Duration) -> Option<MediaFrame> {
        match kind {
            MediaKind::Audio => self.audio_shape.map(|s| MediaFrame::Audio(AudioFrame::silence(s))),
            MediaKind::Video => {
                let mut frame = self.last_video.clone().or_else(|| self.video_shape.map(VideoFrame::black))?;
                let step = i64::try_from(video_step.as_micros()).unwrap_or(i64::MAX);
                frame.timestamp_us = frame.timestamp_us.saturating_add(step);
                self.last_video = Some(frame.clone());
                Some(MediaFrame::Video(frame))
            }
        }
    }
}

enum Command {
    ApplyPolicy(u64),
}

/// State shared by the supervisor, pipelines and idle ticker
pub(crate) struct RelayInner {
    room: RoomId,
    source: ParticipantIdentity,
    identity: ParticipantIdentity,
    config: Arc<RelayConfig>,
    session: Arc<dyn RelaySession>,
    subscriptions: SubscriptionController,
    idle: IdleKeepAlive,

    delay_ms: AtomicU64,
    generation: AtomicU64,
    running: AtomicBool,
    stopped: AtomicBool,
    source_active: AtomicBool,
    capture_failed: [AtomicBool; 2],
    shape_warned: [AtomicBool; 2],

    outputs: Mutex<Outputs>,
    /// One per kind, indexed by `MediaKind::index`
    emission_gates: [tokio::sync::Mutex<()>; 2],
    pipelines: Mutex<HashMap<TrackId, FrameDelayPipeline>>,
    last_live_emit: Mutex<Option<Instant>>,
    counters: RelayCounters,

    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<RelayInner>,
}

/// A running relay for one (room, source) pair
pub struct DelayRelay {
    inner: Arc<RelayInner>,
}

impl DelayRelay {
    /// Connect the relay and bring it to a running state
    ///
    /// Only credential and session failures are returned; every later step
    /// is best-effort.
    pub async fn start(
        ctx: &RelayContext,
        room: RoomId,
        source: ParticipantIdentity,
        delay_ms: u64,
    ) -> Result<Self> {
        let identity = ctx.config.identity.relay_identity(&source);
        let token = ctx.issuer.relay_token(&room, &identity)?;
        let SessionHandle { session, events } = ctx.connector.connect(&room, &identity, &token).await?;

        info!(room = %room, source = %source, relay = %identity, delay_ms, "Relay session connected");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let inner = Arc::new_cyclic(|self_ref| RelayInner {
            subscriptions: SubscriptionController::new(room.clone(), source.clone(), Arc::clone(&ctx.control)),
            idle: IdleKeepAlive::new(&ctx.config, cancel.clone()),
            room,
            source,
            identity,
            config: Arc::clone(&ctx.config),
            session,
            delay_ms: AtomicU64::new(delay_ms),
            generation: AtomicU64::new(0),
            running: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            source_active: AtomicBool::new(false),
            capture_failed: [AtomicBool::new(false), AtomicBool::new(false)],
            shape_warned: [AtomicBool::new(false), AtomicBool::new(false)],
            outputs: Mutex::new(Outputs::default()),
            emission_gates: [tokio::sync::Mutex::new(()), tokio::sync::Mutex::new(())],
            pipelines: Mutex::new(HashMap::new()),
            last_live_emit: Mutex::new(None),
            counters: RelayCounters::default(),
            commands,
            cancel,
            supervisor: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        // Resolves the source tracks even when there is nothing to redirect
        inner.subscriptions.apply(delay_ms).await;

        let handle = tokio::spawn(Arc::clone(&inner).supervise(events, command_rx));
        *inner.supervisor.lock() = Some(handle);

        if inner.idle.start(inner.keep_alive_target()) {
            debug!(relay = %inner.identity, "Idle keep-alive started");
        }

        Ok(Self { inner })
    }

    /// Change the delay; invalidates every frame scheduled so far
    ///
    /// Never waits on the platform: a changed value queues a policy update
    /// on the relay's own task.
    pub fn set_delay(&self, delay_ms: u64) {
        let inner = &self.inner;
        let previous = inner.delay_ms.swap(delay_ms, Ordering::SeqCst);
        let generation = inner.bump_generation();

        debug!(relay = %inner.identity, previous, delay_ms, generation, "Delay updated");

        if previous != delay_ms && inner.commands.send(Command::ApplyPolicy(delay_ms)).is_err() {
            debug!(relay = %inner.identity, "Supervisor gone, policy update dropped");
        }
    }

    /// Tear the relay down; idempotent apart from bumping the generation
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.bump_generation();
        inner.cancel.cancel();
        let supervisor = inner.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                error!(relay = %inner.identity, error = %e, "Relay supervisor panicked");
            }
        }
        inner.teardown("stopped").await;
    }

    #[must_use]
    pub fn room(&self) -> &RoomId {
        &self.inner.room
    }

    #[must_use]
    pub fn source(&self) -> &ParticipantIdentity {
        &self.inner.source
    }

    #[must_use]
    pub fn identity(&self) -> &ParticipantIdentity {
        &self.inner.identity
    }

    #[must_use]
    pub fn delay_ms(&self) -> u64 {
        self.inner.delay_ms.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.idle.is_active()
    }

    /// Source tracks as of the last resync
    #[must_use]
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.inner.subscriptions.track_ids()
    }

    #[must_use]
    pub fn snapshot(&self) -> RelaySnapshot {
        self.inner.snapshot()
    }
}

impl Drop for DelayRelay {
    fn drop(&mut self) {
        // Tasks hold the inner state; release them even without stop()
        self.inner.cancel.cancel();
    }
}

impl RelayInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn keep_alive_target(&self) -> Weak<dyn KeepAliveTarget> {
        self.self_ref.clone()
    }

    fn gate(&self, kind: MediaKind) -> &tokio::sync::Mutex<()> {
        &self.emission_gates[kind.index()]
    }

    fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            room: self.room.clone(),
            source: self.source.clone(),
            relay_identity: self.identity.clone(),
            delay_ms: self.delay_ms.load(Ordering::SeqCst),
            generation: self.generation.load(Ordering::SeqCst),
            running: self.is_running(),
            source_active: self.source_active.load(Ordering::SeqCst),
            idle_active: self.idle.is_active(),
            track_ids: self.subscriptions.track_ids(),
            published: self.outputs.lock().published(),
            capture_failed: CaptureFailures {
                audio: self.capture_failed[MediaKind::Audio.index()].load(Ordering::SeqCst),
                video: self.capture_failed[MediaKind::Video.index()].load(Ordering::SeqCst),
            },
            frames_received: self.counters.received.load(Ordering::Relaxed),
            frames_forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            idle_frames: self.counters.idle.load(Ordering::Relaxed),
        }
    }

    async fn supervise(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut watchdog = interval(self.config.idle_poll_interval());
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(command) = commands.recv() => match command {
                    Command::ApplyPolicy(delay_ms) => tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = self.subscriptions.apply(delay_ms) => {}
                    },
                },
                event = events.recv() => match event {
                    Some(SessionEvent::Disconnected { reason }) => {
                        warn!(relay = %self.identity, reason = %reason, "Relay session disconnected");
                        self.teardown("session disconnected").await;
                        break;
                    }
                    Some(event) => tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = self.handle_event(event) => {}
                    },
                    None => {
                        warn!(relay = %self.identity, "Relay event stream closed");
                        self.teardown("event stream closed").await;
                        break;
                    }
                },
                _ = watchdog.tick() => self.check_stall(),
            }
        }

        debug!(relay = %self.identity, "Relay supervisor stopped");
    }

    async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::TrackSubscribed {
                participant,
                track,
                kind,
                frames,
            } if participant == self.source => self.attach_pipeline(track, kind, frames),
            SessionEvent::TrackUnsubscribed { participant, track } if participant == self.source => {
                self.pipelines.lock().remove(&track);
                self.source_lost("track unsubscribed");
            }
            SessionEvent::TrackPublished { participant, track, kind } if participant == self.source => {
                debug!(relay = %self.identity, track = %track, kind = kind.as_str(), "Source published track");
                let delay_ms = self.delay_ms.load(Ordering::SeqCst);
                if delay_ms > 0 {
                    self.subscriptions.apply(delay_ms).await;
                } else {
                    self.resync().await;
                }
            }
            SessionEvent::TrackUnpublished { participant, track } if participant == self.source => {
                debug!(relay = %self.identity, track = %track, "Source unpublished track");
                self.pipelines.lock().remove(&track);
                self.resync().await;
                if self.subscriptions.track_ids().is_empty() {
                    self.source_lost("source tracks unpublished");
                }
            }
            SessionEvent::ParticipantConnected { participant, role }
                if participant != self.source && participant != self.identity =>
            {
                self.admit(&participant, role).await;
            }
            SessionEvent::ParticipantDisconnected { participant } if participant == self.source => {
                self.pipelines.lock().clear();
                self.source_lost("source disconnected");
            }
            other => trace!(relay = %self.identity, event = ?other, "Ignoring event"),
        }
    }

    async fn resync(&self) {
        if let Err(e) = self.subscriptions.resync().await {
            warn!(relay = %self.identity, error = %e, "Failed to resync source tracks");
        }
    }

    async fn admit(&self, participant: &ParticipantIdentity, role: ParticipantRole) {
        if !role.is_real() || self.delay_ms.load(Ordering::SeqCst) == 0 {
            return;
        }
        let relay_tracks = self.outputs.lock().published();
        self.subscriptions.admit(participant, &relay_tracks).await;
    }

    fn attach_pipeline(&self, track: TrackId, kind: MediaKind, frames: mpsc::Receiver<MediaFrame>) {
        let Some(sink) = self.self_ref.upgrade() else {
            return;
        };
        let sink: Arc<dyn FrameSink> = sink;
        let pipeline = FrameDelayPipeline::spawn(sink, track.clone(), kind, frames, self.cancel.child_token());

        info!(relay = %self.identity, track = %track, kind = kind.as_str(), "Source track attached");
        self.source_active.store(true, Ordering::SeqCst);
        // A replaced pipeline is cancelled on drop
        self.pipelines.lock().insert(track, pipeline);
    }

    fn source_lost(&self, reason: &str) {
        let generation = self.bump_generation();
        let remaining = {
            let mut pipelines = self.pipelines.lock();
            pipelines.retain(|_, p| !p.is_finished());
            pipelines.len()
        };
        if remaining == 0 {
            self.source_active.store(false, Ordering::SeqCst);
        }

        info!(relay = %self.identity, reason, generation, remaining, "Source media lost");

        if self.is_running() && self.idle.start(self.keep_alive_target()) {
            info!(relay = %self.identity, "Idle keep-alive started");
        }
    }

    fn check_stall(&self) {
        if !self.is_running() || self.idle.is_active() {
            return;
        }
        let stalled = self
            .last_live_emit
            .lock()
            .map_or(true, |at| at.elapsed() >= self.config.stall_threshold());
        if stalled && self.idle.start(self.keep_alive_target()) {
            debug!(relay = %self.identity, "Live media stalled, idle keep-alive started");
        }
    }

    async fn teardown(&self, reason: &str) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        let generation = self.bump_generation();
        self.cancel.cancel();
        self.idle.stop();

        // Gate holders race the token cancelled above, so these return promptly
        for gate in &self.emission_gates {
            drop(gate.lock().await);
        }
        self.pipelines.lock().clear();

        self.subscriptions.restore().await;
        if tokio::time::timeout(SESSION_CLOSE_TIMEOUT, self.session.close()).await.is_err() {
            warn!(relay = %self.identity, "Session close timed out");
        }

        let mut outputs = self.outputs.lock();
        outputs.audio = None;
        outputs.video = None;
        outputs.last_video = None;
        drop(outputs);

        info!(relay = %self.identity, room = %self.room, reason, generation, "Relay stopped");
    }

    /// Lazily published output track for `shape`; call with the gate held
    async fn output_track(&self, shape: TrackShape) -> Option<Arc<dyn LocalTrack>> {
        let kind = shape.kind();
        let fixed = {
            let mut outputs = self.outputs.lock();
            if let Some(track) = outputs.track(kind) {
                if outputs.shape(kind) != Some(shape) && !self.shape_warned[kind.index()].swap(true, Ordering::SeqCst) {
                    warn!(
                        relay = %self.identity,
                        kind = kind.as_str(),
                        published = ?outputs.shape(kind),
                        observed = ?shape,
                        "Source shape changed, keeping published shape"
                    );
                }
                return Some(Arc::clone(track));
            }
            outputs.fix_shape(shape);
            outputs.shape(kind)?
        };

        let published = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return None,
            result = self.session.publish_track(fixed) => result,
        };
        match published {
            Ok(track) => {
                info!(relay = %self.identity, kind = kind.as_str(), track = %track.sid(), "Relay track published");
                self.outputs.lock().set_track(kind, Arc::clone(&track));
                Some(track)
            }
            Err(e) => {
                self.mark_failed(kind, &e);
                None
            }
        }
    }

    /// Publish if needed and capture; call with the gate held
    async fn deliver(&self, frame: MediaFrame) -> bool {
        let kind = frame.kind();
        if self.capture_failed[kind.index()].load(Ordering::SeqCst) {
            return false;
        }
        let Some(track) = self.output_track(frame.shape()).await else {
            return false;
        };
        let captured = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return false,
            result = track.capture(frame) => result,
        };
        match captured {
            Ok(()) => true,
            Err(e) => {
                self.mark_failed(kind, &e);
                false
            }
        }
    }

    fn mark_failed(&self, kind: MediaKind, err: &Error) {
        if !self.capture_failed[kind.index()].swap(true, Ordering::SeqCst) {
            warn!(
                relay = %self.identity,
                kind = kind.as_str(),
                error = %err,
                "Relay output failed, forwarding of this kind disabled"
            );
        }
    }
}

#[async_trait]
impl FrameSink for RelayInner {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::SeqCst))
    }

    fn observe(&self, _frame: &MediaFrame) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
    }

    async fn emit(&self, frame: MediaFrame, generation: u64) {
        let _gate = self.gate(frame.kind()).lock().await;
        if !self.is_running() || self.generation.load(Ordering::SeqCst) != generation {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let last_video = match &frame {
            MediaFrame::Video(video) => Some(video.clone()),
            MediaFrame::Audio(_) => None,
        };
        if !self.deliver(frame).await {
            return;
        }

        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        *self.last_live_emit.lock() = Some(Instant::now());
        if let Some(video) = last_video {
            self.outputs.lock().last_video = Some(video);
        }
        self.source_active.store(true, Ordering::SeqCst);
        if self.idle.stop() {
            info!(relay = %self.identity, "Live media resumed, idle keep-alive stopped");
        }
    }
}

#[async_trait]
impl KeepAliveTarget for RelayInner {
    async fn ensure_tracks(&self) {
        join_all(MediaKind::ALL.map(|kind| async move {
            let _gate = self.gate(kind).lock().await;
            if !self.is_running() || self.capture_failed[kind.index()].load(Ordering::SeqCst) {
                return;
            }
            let pending = {
                let outputs = self.outputs.lock();
                if outputs.track(kind).is_some() {
                    None
                } else {
                    outputs.shape(kind)
                }
            };
            if let Some(shape) = pending {
                self.output_track(shape).await;
            }
        }))
        .await;
    }

    async fn emit_filler(&self, kind: MediaKind) {
        let _gate = self.gate(kind).lock().await;
        // Live media may have resumed while waiting for the gate
        if !self.is_running() || !self.idle.is_active() {
            return;
        }
        let Some(frame) = self.outputs.lock().filler(kind, self.config.video_idle_interval()) else {
            return;
        };
        if self.deliver(frame).await {
            self.counters.idle.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn filler_period(&self, kind: MediaKind) -> Option<Duration> {
        match kind {
            MediaKind::Audio => self.outputs.lock().audio_shape.and_then(|s| s.frame_duration()),
            MediaKind::Video => None,
        }
    }
}
