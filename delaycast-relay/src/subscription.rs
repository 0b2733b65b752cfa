//! Per-viewer subscription steering
//!
//! While a relay delays a source, every other real participant is
//! unsubscribed from the source's raw tracks so that only the relay's delayed
//! copy reaches them. Dropping back to zero delay resubscribes them to
//! everything that was redirected.

use crate::platform::{ParticipantInfo, RoomControl};
use crate::types::{ParticipantIdentity, RoomId, TrackId};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SubscriptionController {
    room: RoomId,
    source: ParticipantIdentity,
    control: Arc<dyn RoomControl>,
    /// Source tracks as of the last resync
    track_ids: Mutex<BTreeSet<TrackId>>,
    /// Source tracks viewers are currently unsubscribed from
    redirected: Mutex<BTreeSet<TrackId>>,
    /// Audience of the last redirect, used only when the roster is unavailable
    last_audience: Mutex<Vec<ParticipantIdentity>>,
}

impl SubscriptionController {
    pub fn new(room: RoomId, source: ParticipantIdentity, control: Arc<dyn RoomControl>) -> Self {
        Self {
            room,
            source,
            control,
            track_ids: Mutex::new(BTreeSet::new()),
            redirected: Mutex::new(BTreeSet::new()),
            last_audience: Mutex::new(Vec::new()),
        }
    }

    /// Source tracks as of the last resync
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.track_ids.lock().iter().cloned().collect()
    }

    /// Whether any viewer is currently redirected away from the source
    pub fn is_redirected(&self) -> bool {
        !self.redirected.lock().is_empty()
    }

    /// Refresh the source track set from the roster and return the roster
    pub async fn resync(&self) -> crate::Result<Vec<ParticipantInfo>> {
        let roster = self.control.list_participants(&self.room).await?;
        let ids: BTreeSet<TrackId> = roster
            .iter()
            .find(|p| p.identity == self.source)
            .map(|p| p.track_ids().into_iter().collect())
            .unwrap_or_default();

        debug!(room = %self.room, source = %self.source, tracks = ids.len(), "Resynced source tracks");
        *self.track_ids.lock() = ids;
        Ok(roster)
    }

    /// Bring viewers in line with `delay_ms`
    pub async fn apply(&self, delay_ms: u64) {
        if delay_ms > 0 {
            self.redirect().await;
        } else {
            self.restore().await;
        }
    }

    async fn redirect(&self) {
        let roster = match self.resync().await {
            Ok(roster) => roster,
            Err(e) => {
                warn!(room = %self.room, source = %self.source, error = %e, "Roster unavailable, redirect skipped");
                return;
            }
        };

        let ids = self.track_ids();
        if ids.is_empty() {
            debug!(room = %self.room, source = %self.source, "Source has no tracks to redirect");
            return;
        }

        let audience = self.audience(&roster);
        self.redirected.lock().extend(ids.iter().cloned());
        *self.last_audience.lock() = audience.clone();

        let failed = self.toggle_all(&audience, &ids, false).await;
        info!(
            room = %self.room,
            source = %self.source,
            viewers = audience.len(),
            tracks = ids.len(),
            failed,
            "Viewers redirected to relay"
        );
    }

    /// Resubscribe viewers to every redirected source track
    ///
    /// No-op when nothing was redirected.
    pub async fn restore(&self) {
        let audience = match self.resync().await {
            Ok(roster) => self.audience(&roster),
            Err(e) => {
                warn!(room = %self.room, source = %self.source, error = %e, "Roster unavailable, restoring last known audience");
                self.last_audience.lock().clone()
            }
        };

        let ids: Vec<TrackId> = {
            let mut redirected = self.redirected.lock();
            if redirected.is_empty() {
                return;
            }
            redirected.extend(self.track_ids.lock().iter().cloned());
            std::mem::take(&mut *redirected).into_iter().collect()
        };
        self.last_audience.lock().clear();

        let failed = self.toggle_all(&audience, &ids, true).await;
        info!(
            room = %self.room,
            source = %self.source,
            viewers = audience.len(),
            tracks = ids.len(),
            failed,
            "Viewers restored to source"
        );
    }

    /// Redirect a participant who joined while delay is active
    ///
    /// The joiner counts as redirected, so a later restore resubscribes them
    /// even if the redirect that preceded the join was skipped.
    pub async fn admit(&self, viewer: &ParticipantIdentity, relay_tracks: &[TrackId]) {
        let ids = self.track_ids();
        if !ids.is_empty() {
            self.redirected.lock().extend(ids.iter().cloned());
            {
                let mut audience = self.last_audience.lock();
                if !audience.contains(viewer) {
                    audience.push(viewer.clone());
                }
            }
            if let Err(e) = self.control.update_subscriptions(&self.room, viewer, &ids, false).await {
                warn!(room = %self.room, viewer = %viewer, error = %e, "Failed to unsubscribe late joiner from source");
            }
        }
        if !relay_tracks.is_empty() {
            if let Err(e) = self.control.update_subscriptions(&self.room, viewer, relay_tracks, true).await {
                warn!(room = %self.room, viewer = %viewer, error = %e, "Failed to subscribe late joiner to relay");
            }
        }
        debug!(room = %self.room, viewer = %viewer, "Late joiner admitted");
    }

    /// Real participants other than the source
    fn audience(&self, roster: &[ParticipantInfo]) -> Vec<ParticipantIdentity> {
        roster
            .iter()
            .filter(|p| p.identity != self.source && p.role.is_real())
            .map(|p| p.identity.clone())
            .collect()
    }

    /// Toggle every viewer independently; returns the number of failures
    async fn toggle_all(&self, audience: &[ParticipantIdentity], ids: &[TrackId], subscribe: bool) -> usize {
        let calls = audience.iter().map(|viewer| async move {
            match self.control.update_subscriptions(&self.room, viewer, ids, subscribe).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        room = %self.room,
                        viewer = %viewer,
                        subscribe,
                        error = %e,
                        "Subscription toggle failed"
                    );
                    false
                }
            }
        });

        join_all(calls).await.into_iter().filter(|ok| !ok).count()
    }
}
