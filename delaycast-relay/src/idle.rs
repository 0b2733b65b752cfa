//! Idle keep-alive
//!
//! While the source has no flowing media, a ticker keeps the relay's
//! published tracks fed: digital silence on the audio clock and a repeat of
//! the last emitted picture on a coarser video interval. Each kind ticks
//! independently, so a stuck output of one kind never starves the other.

use crate::config::RelayConfig;
use crate::media::MediaKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// What idle keep-alive feeds
#[async_trait]
pub(crate) trait KeepAliveTarget: Send + Sync {
    /// Publish relay tracks for every known shape that has none yet
    async fn ensure_tracks(&self);

    /// Capture one filler frame of `kind`, if anything is known about it
    async fn emit_filler(&self, kind: MediaKind);

    /// Filler period dictated by the published shape of `kind`, if any
    fn filler_period(&self, _kind: MediaKind) -> Option<Duration> {
        None
    }
}

pub(crate) struct IdleKeepAlive {
    audio_interval: Duration,
    video_interval: Duration,
    parent: CancellationToken,
    /// Some while the ticker runs
    ticker: Mutex<Option<CancellationToken>>,
    /// Held while an ensure-tracks step is in flight
    ensuring: Arc<AtomicBool>,
}

impl IdleKeepAlive {
    pub(crate) fn new(config: &RelayConfig, parent: CancellationToken) -> Self {
        Self {
            audio_interval: config.audio_idle_interval(),
            video_interval: config.video_idle_interval(),
            parent,
            ticker: Mutex::new(None),
            ensuring: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Start the ticker; returns false if it was already running
    pub(crate) fn start(&self, target: Weak<dyn KeepAliveTarget>) -> bool {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() || self.parent.is_cancelled() {
            return false;
        }
        let token = self.parent.child_token();
        *ticker = Some(token.clone());
        drop(ticker);

        tokio::spawn(run(
            target,
            token,
            Arc::clone(&self.ensuring),
            self.audio_interval,
            self.video_interval,
        ));
        true
    }

    /// Stop the ticker; returns false if it was not running
    pub(crate) fn stop(&self) -> bool {
        match self.ticker.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

async fn run(
    target: Weak<dyn KeepAliveTarget>,
    token: CancellationToken,
    ensuring: Arc<AtomicBool>,
    audio_interval: Duration,
    video_interval: Duration,
) {
    debug!("Idle keep-alive ticker started");

    tokio::join!(
        ensure(&target, &ensuring),
        tick(&target, &token, MediaKind::Audio, audio_interval),
        tick(&target, &token, MediaKind::Video, video_interval),
    );

    debug!("Idle keep-alive ticker stopped");
}

/// Latch-guarded track ensure; runs to completion even if the ticker stops
async fn ensure(target: &Weak<dyn KeepAliveTarget>, ensuring: &AtomicBool) {
    if ensuring.swap(true, Ordering::AcqRel) {
        trace!("Track ensure already in flight");
        return;
    }
    if let Some(target) = target.upgrade() {
        target.ensure_tracks().await;
    }
    ensuring.store(false, Ordering::Release);
}

fn ticker(period: Duration, start: Instant) -> Interval {
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn tick(target: &Weak<dyn KeepAliveTarget>, token: &CancellationToken, kind: MediaKind, fallback: Duration) {
    let mut period = fallback;
    let mut clock = ticker(period, Instant::now());

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = clock.tick() => {}
        }

        let Some(target) = target.upgrade() else {
            break;
        };
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            () = target.emit_filler(kind) => {}
        }

        // Follow the published clock once a shape is known
        if let Some(wanted) = target.filler_period(kind).filter(|p| !p.is_zero()) {
            if wanted != period {
                trace!(kind = kind.as_str(), ?period, ?wanted, "Filler period adjusted");
                period = wanted;
                clock = ticker(period, Instant::now() + period);
            }
        }
    }
}
