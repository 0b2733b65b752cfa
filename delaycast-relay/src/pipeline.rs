//! Delay-and-forward for one source track
//!
//! Every incoming frame is copied, tagged with the relay generation current
//! at arrival and queued with a due time of `arrival + delay`. The sink
//! re-checks the tag at fire time, so frames scheduled before a delay change
//! or a stop are dropped instead of emitted.
//!
//! Frames of one generation share one delay, so their due times are
//! monotonic and a FIFO is enough to keep arrival order. A generation change
//! purges the queue on the next arrival; stale frames still queued when no
//! new frame arrives are dropped by the sink.

use crate::media::{MediaFrame, MediaKind};
use crate::types::TrackId;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Receiver side of a pipeline
#[async_trait]
pub(crate) trait FrameSink: Send + Sync {
    /// Generation to tag newly arriving frames with
    fn generation(&self) -> u64;

    /// Delay applied to newly arriving frames
    fn delay(&self) -> Duration;

    /// Called for every arriving frame before it is queued
    fn observe(&self, frame: &MediaFrame);

    /// Emit a due frame; drops it if `generation` is no longer current
    async fn emit(&self, frame: MediaFrame, generation: u64);
}

struct Scheduled {
    due: Instant,
    generation: u64,
    frame: MediaFrame,
}

/// FIFO of frames waiting for their due time
#[derive(Default)]
struct DelayLine {
    queue: VecDeque<Scheduled>,
}

impl DelayLine {
    fn schedule(&mut self, frame: MediaFrame, generation: u64, due: Instant) {
        if self.queue.front().is_some_and(|s| s.generation != generation) {
            self.queue.retain(|s| s.generation == generation);
        }
        self.queue.push_back(Scheduled { due, generation, frame });
    }

    fn next_due(&self) -> Option<Instant> {
        self.queue.front().map(|s| s.due)
    }

    fn pop_due(&mut self, now: Instant) -> Option<Scheduled> {
        if self.queue.front()?.due <= now {
            self.queue.pop_front()
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Running delay pipeline for one source track; cancelled on drop
pub(crate) struct FrameDelayPipeline {
    track: TrackId,
    kind: MediaKind,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl FrameDelayPipeline {
    pub(crate) fn spawn(
        sink: Arc<dyn FrameSink>,
        track: TrackId,
        kind: MediaKind,
        frames: mpsc::Receiver<MediaFrame>,
        cancel: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(run(sink, track.clone(), kind, frames, cancel.clone()));
        Self {
            track,
            kind,
            cancel,
            handle,
        }
    }

    pub(crate) const fn kind(&self) -> MediaKind {
        self.kind
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for FrameDelayPipeline {
    fn drop(&mut self) {
        trace!(track = %self.track, kind = self.kind.as_str(), "Pipeline dropped");
        self.cancel.cancel();
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run(
    sink: Arc<dyn FrameSink>,
    track: TrackId,
    kind: MediaKind,
    mut frames: mpsc::Receiver<MediaFrame>,
    cancel: CancellationToken,
) {
    let mut line = DelayLine::default();
    let mut input_open = true;

    debug!(track = %track, kind = kind.as_str(), "Delay pipeline started");

    loop {
        let next_due = line.next_due();
        if !input_open && next_due.is_none() {
            break;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = wait_until(next_due) => {
                while let Some(item) = line.pop_due(Instant::now()) {
                    sink.emit(item.frame, item.generation).await;
                }
            }
            frame = frames.recv(), if input_open => match frame {
                Some(frame) => {
                    sink.observe(&frame);
                    // Tag before reading the delay: a concurrent delay change
                    // stores the new delay first and bumps the generation after
                    let generation = sink.generation();
                    let due = Instant::now() + sink.delay();
                    line.schedule(frame.detached(), generation, due);
                }
                None => input_open = false,
            },
        }
    }

    debug!(
        track = %track,
        kind = kind.as_str(),
        discarded = line.len(),
        "Delay pipeline stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{audio_frame, settle};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        generation: AtomicU64,
        delay_ms: AtomicU64,
        observed: AtomicU64,
        emitted: Mutex<Vec<(Instant, u64, MediaFrame)>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        fn generation(&self) -> u64 {
            self.generation.load(Ordering::SeqCst)
        }

        fn delay(&self) -> Duration {
            Duration::from_millis(self.delay_ms.load(Ordering::SeqCst))
        }

        fn observe(&self, _frame: &MediaFrame) {
            self.observed.fetch_add(1, Ordering::SeqCst);
        }

        async fn emit(&self, frame: MediaFrame, generation: u64) {
            self.emitted.lock().push((Instant::now(), generation, frame));
        }
    }

    fn first_byte(frame: &MediaFrame) -> u8 {
        frame.data()[0]
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_emitted_after_delay_in_order() {
        let sink = Arc::new(RecordingSink::default());
        sink.delay_ms.store(300, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        let _pipeline = FrameDelayPipeline::spawn(
            sink.clone(),
            TrackId::from("TR_a"),
            MediaKind::Audio,
            rx,
            CancellationToken::new(),
        );

        let start = Instant::now();
        for fill in 1..=3u8 {
            tx.send(audio_frame(fill, 480)).await.unwrap();
            settle().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(sink.emitted.lock().is_empty(), "nothing is due before 300ms");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let emitted = sink.emitted.lock();
        assert_eq!(emitted.len(), 3);
        assert_eq!(
            emitted.iter().map(|(_, _, f)| first_byte(f)).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(emitted[0].0 - start >= Duration::from_millis(300));
        assert_eq!(sink.observed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_is_still_deferred() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(4);
        let _pipeline = FrameDelayPipeline::spawn(
            sink.clone(),
            TrackId::from("TR_a"),
            MediaKind::Audio,
            rx,
            CancellationToken::new(),
        );

        tx.send(audio_frame(9, 480)).await.unwrap();
        assert!(sink.emitted.lock().is_empty());

        settle().await;
        assert_eq!(sink.emitted.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_change_purges_queue() {
        let sink = Arc::new(RecordingSink::default());
        sink.delay_ms.store(2_000, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(4);
        let _pipeline = FrameDelayPipeline::spawn(
            sink.clone(),
            TrackId::from("TR_v"),
            MediaKind::Video,
            rx,
            CancellationToken::new(),
        );

        tx.send(audio_frame(1, 480)).await.unwrap();
        settle().await;

        // Delay drops to zero: new delay first, then a new generation
        sink.delay_ms.store(0, Ordering::SeqCst);
        sink.generation.store(1, Ordering::SeqCst);
        tx.send(audio_frame(2, 480)).await.unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        let emitted = sink.emitted.lock();
        assert_eq!(emitted.len(), 1, "stale frame must never reach the sink");
        assert_eq!(emitted[0].1, 1);
        assert_eq!(first_byte(&emitted[0].2), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_emissions() {
        let sink = Arc::new(RecordingSink::default());
        sink.delay_ms.store(500, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(4);
        let pipeline = FrameDelayPipeline::spawn(
            sink.clone(),
            TrackId::from("TR_a"),
            MediaKind::Audio,
            rx,
            CancellationToken::new(),
        );

        tx.send(audio_frame(1, 480)).await.unwrap();
        settle().await;
        drop(pipeline);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sink.emitted.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_input_drains_then_finishes() {
        let sink = Arc::new(RecordingSink::default());
        sink.delay_ms.store(100, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(4);
        let pipeline = FrameDelayPipeline::spawn(
            sink.clone(),
            TrackId::from("TR_a"),
            MediaKind::Audio,
            rx,
            CancellationToken::new(),
        );

        tx.send(audio_frame(1, 480)).await.unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;

        assert_eq!(sink.emitted.lock().len(), 1);
        assert!(pipeline.is_finished());
        assert_eq!(pipeline.kind(), MediaKind::Audio);
    }

    #[test]
    fn test_delay_line_pop_due() {
        let mut line = DelayLine::default();
        let now = Instant::now();
        line.schedule(audio_frame(1, 10), 0, now + Duration::from_millis(5));
        line.schedule(audio_frame(2, 10), 0, now + Duration::from_millis(10));

        assert!(line.pop_due(now).is_none());
        assert_eq!(line.next_due(), Some(now + Duration::from_millis(5)));
        let first = line.pop_due(now + Duration::from_millis(7)).unwrap();
        assert_eq!(first_byte(&first.frame), 1);
        assert_eq!(line.len(), 1);
    }
}
