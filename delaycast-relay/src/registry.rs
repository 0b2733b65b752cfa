//! Relay registry - top-level control surface
//!
//! This module provides:
//! - At most one relay per (room, participant), even under concurrent requests
//! - Delay validation and relay lifecycle (create, retune, tear down)
//! - Automatic removal of empty rooms and of relays whose session died
//! - Background maintenance sweep

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::platform::ParticipantInfo;
use crate::relay::{DelayRelay, RelayContext, RelaySnapshot};
use crate::types::{ParticipantIdentity, ParticipantRole, RoomId};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a set-delay request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDelayOutcome {
    /// Whether a relay exists for the pair after the request
    pub active: bool,
}

type PairKey = (RoomId, ParticipantIdentity);

/// Registry of delay relays, keyed by room then source participant
pub struct RelayRegistry {
    ctx: RelayContext,

    /// Active relays (DashMap for concurrent access across rooms)
    rooms: DashMap<RoomId, HashMap<ParticipantIdentity, Arc<DelayRelay>>>,

    /// Serializes create/retune/remove for one pair while a slow start is in flight
    creation_locks: DashMap<PairKey, Arc<AsyncMutex<()>>>,

    shutdown: CancellationToken,
}

impl RelayRegistry {
    /// Create a registry and start its maintenance task
    pub fn new(ctx: RelayContext) -> Arc<Self> {
        let registry = Arc::new(Self {
            ctx,
            rooms: DashMap::new(),
            creation_locks: DashMap::new(),
            shutdown: CancellationToken::new(),
        });

        info!(
            max_delay_ms = registry.ctx.config.max_delay_ms,
            relay_prefix = %registry.ctx.config.identity.relay_prefix,
            "Relay registry initialized"
        );

        tokio::spawn(maintenance_task(
            Arc::downgrade(&registry),
            registry.shutdown.clone(),
            registry.ctx.config.maintenance_interval(),
        ));

        registry
    }

    /// Get configuration
    pub fn config(&self) -> &RelayConfig {
        &self.ctx.config
    }

    /// Create, retune or tear down the relay for `participant`
    pub async fn set_delay(
        &self,
        room: RoomId,
        participant: ParticipantIdentity,
        delay_ms: u64,
        keep_alive: bool,
    ) -> Result<SetDelayOutcome> {
        self.validate(&room, &participant, delay_ms)?;

        let key = (room, participant);
        let lock = self.creation_lock(&key);
        let outcome = {
            let _guard = lock.lock().await;
            self.apply_delay(&key, delay_ms, keep_alive).await
        };
        drop(lock);
        self.release_creation_lock(&key);
        outcome
    }

    async fn apply_delay(&self, key: &PairKey, delay_ms: u64, keep_alive: bool) -> Result<SetDelayOutcome> {
        let (room, participant) = key;
        let existing = match self.lookup(room, participant) {
            Some(relay) if !relay.is_running() => {
                debug!(room = %room, participant = %participant, "Replacing relay whose session ended");
                self.detach(room, participant, &relay);
                relay.stop().await;
                None
            }
            other => other,
        };

        if delay_ms == 0 && !keep_alive {
            if let Some(relay) = existing {
                self.detach(room, participant, &relay);
                relay.stop().await;
                info!(room = %room, participant = %participant, "Relay removed (delay cleared)");
            }
            return Ok(SetDelayOutcome { active: false });
        }

        if let Some(relay) = existing {
            relay.set_delay(delay_ms);
            return Ok(SetDelayOutcome { active: true });
        }

        let relay = match DelayRelay::start(&self.ctx, room.clone(), participant.clone(), delay_ms).await {
            Ok(relay) => Arc::new(relay),
            Err(e) => {
                warn!(room = %room, participant = %participant, error = %e, "Failed to start relay");
                return Err(e);
            }
        };

        let total = {
            let mut relays = self.rooms.entry(room.clone()).or_default();
            relays.insert(participant.clone(), relay);
            relays.len()
        };

        info!(
            room = %room,
            participant = %participant,
            delay_ms,
            keep_alive,
            room_relays = total,
            "Relay created"
        );

        Ok(SetDelayOutcome { active: true })
    }

    /// Tear down the relay for `participant`; returns whether one existed
    pub async fn remove_relay(&self, room: &RoomId, participant: &ParticipantIdentity) -> bool {
        let key = (room.clone(), participant.clone());
        let lock = self.creation_lock(&key);
        let removed = {
            let _guard = lock.lock().await;
            match self.lookup(room, participant) {
                Some(relay) => {
                    self.detach(room, participant, &relay);
                    relay.stop().await;
                    true
                }
                None => false,
            }
        };
        drop(lock);
        self.release_creation_lock(&key);

        if removed {
            info!(room = %room, participant = %participant, "Relay removed");
        } else {
            debug!(room = %room, participant = %participant, "No relay to remove");
        }
        removed
    }

    /// Current delay of every running relay in `room`
    pub fn status(&self, room: &RoomId) -> BTreeMap<ParticipantIdentity, u64> {
        self.rooms
            .get(room)
            .map(|relays| {
                relays
                    .iter()
                    .filter(|(_, relay)| relay.is_running())
                    .map(|(participant, relay)| (participant.clone(), relay.delay_ms()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of one relay
    pub fn snapshot(&self, room: &RoomId, participant: &ParticipantIdentity) -> Option<RelaySnapshot> {
        self.lookup(room, participant).map(|relay| relay.snapshot())
    }

    /// Real participants currently in `room`
    pub async fn participants(&self, room: &RoomId) -> Result<Vec<ParticipantInfo>> {
        let roster = self.ctx.control.list_participants(room).await?;
        Ok(roster.into_iter().filter(|p| p.role.is_real()).collect())
    }

    /// Get number of rooms with at least one relay
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Get number of relays across all rooms
    pub fn relay_count(&self) -> usize {
        self.rooms.iter().map(|entry| entry.value().len()).sum()
    }

    /// Remove relays that stopped on their own (session lost)
    pub async fn prune_stopped(&self) -> usize {
        let stopped: Vec<(RoomId, ParticipantIdentity, Arc<DelayRelay>)> = self
            .rooms
            .iter()
            .flat_map(|entry| {
                let room = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .filter(|(_, relay)| !relay.is_running())
                    .map(|(participant, relay)| (room.clone(), participant.clone(), Arc::clone(relay)))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut removed = 0;
        for (room, participant, relay) in stopped {
            if self.detach(&room, &participant, &relay) {
                relay.stop().await;
                removed += 1;
                debug!(room = %room, participant = %participant, "Pruned stopped relay");
            }
        }

        if removed > 0 {
            info!(removed, remaining = self.relay_count(), "Pruned stopped relays");
        }
        removed
    }

    /// Stop every relay and the maintenance task
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let keys: Vec<RoomId> = self.rooms.iter().map(|entry| entry.key().clone()).collect();
        let relays: Vec<Arc<DelayRelay>> = keys
            .iter()
            .filter_map(|room| self.rooms.remove(room))
            .flat_map(|(_, relays)| relays.into_values())
            .collect();

        let count = relays.len();
        join_all(relays.iter().map(|relay| relay.stop())).await;
        info!(stopped = count, "Relay registry shut down");
    }

    fn validate(&self, room: &RoomId, participant: &ParticipantIdentity, delay_ms: u64) -> Result<()> {
        let max = self.ctx.config.max_delay_ms;
        if delay_ms > max {
            return Err(Error::InvalidDelay { requested: delay_ms, max });
        }
        if room.as_str().is_empty() {
            return Err(Error::InvalidParticipant("room must not be empty".to_string()));
        }
        if participant.as_str().is_empty() {
            return Err(Error::InvalidParticipant("participant must not be empty".to_string()));
        }
        let role = self.ctx.config.identity.classify(participant, "");
        if role != ParticipantRole::Source {
            return Err(Error::InvalidParticipant(format!(
                "{participant} is a {role:?} participant and cannot be delayed"
            )));
        }
        Ok(())
    }

    fn lookup(&self, room: &RoomId, participant: &ParticipantIdentity) -> Option<Arc<DelayRelay>> {
        self.rooms.get(room).and_then(|relays| relays.get(participant).cloned())
    }

    /// Unregister exactly `relay`; the room entry goes when its last relay does
    fn detach(&self, room: &RoomId, participant: &ParticipantIdentity, relay: &Arc<DelayRelay>) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(mut relays) => {
                if relays.get(participant).is_some_and(|r| Arc::ptr_eq(r, relay)) {
                    relays.remove(participant);
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        if self.rooms.remove_if(room, |_, relays| relays.is_empty()).is_some() {
            debug!(room = %room, "Removed empty room");
        }
        removed
    }

    fn creation_lock(&self, key: &PairKey) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.creation_locks.entry(key.clone()).or_default().value())
    }

    fn release_creation_lock(&self, key: &PairKey) {
        self.creation_locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Background task for periodic pruning
async fn maintenance_task(registry: Weak<RelayRegistry>, shutdown: CancellationToken, period: std::time::Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    debug!(interval_secs = period.as_secs(), "Starting relay maintenance task");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.prune_stopped().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SessionEvent;
    use crate::test_helpers::{settle, stage_roster, test_context, MockConnector, MockRoomControl};

    fn registry() -> (Arc<RelayRegistry>, Arc<MockRoomControl>, Arc<MockConnector>) {
        let (ctx, control, connector) = test_context(RelayConfig::default());
        stage_roster(&control);
        (RelayRegistry::new(ctx), control, connector)
    }

    fn stage() -> RoomId {
        RoomId::from("stage")
    }

    fn alice() -> ParticipantIdentity {
        ParticipantIdentity::from("alice")
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let (registry, _, _) = registry();
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.relay_count(), 0);
        assert_eq!(registry.config().max_delay_ms, 10_000);
    }

    #[tokio::test]
    async fn test_relay_lifecycle() {
        let (registry, _, connector) = registry();

        let outcome = registry.set_delay(stage(), alice(), 500, false).await.unwrap();
        assert!(outcome.active);
        assert_eq!(registry.relay_count(), 1);

        // Same pair reuses the existing relay
        let outcome = registry.set_delay(stage(), alice(), 800, false).await.unwrap();
        assert!(outcome.active);
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(registry.status(&stage()).get(&alice()), Some(&800));

        let outcome = registry.set_delay(stage(), alice(), 0, false).await.unwrap();
        assert!(!outcome.active);
        assert_eq!(registry.room_count(), 0);
        assert!(connector.session("relay-alice").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_keep_alive_zero_creates_pass_through() {
        let (registry, control, _) = registry();

        let outcome = registry.set_delay(stage(), alice(), 0, true).await.unwrap();
        assert!(outcome.active);
        assert_eq!(registry.status(&stage()).get(&alice()), Some(&0));
        assert!(control.calls().is_empty(), "nothing to redirect at zero delay");
    }

    #[tokio::test]
    async fn test_zero_without_relay_is_noop() {
        let (registry, _, connector) = registry();

        let outcome = registry.set_delay(stage(), alice(), 0, false).await.unwrap();
        assert!(!outcome.active);
        assert_eq!(connector.connect_count(), 0);
        assert!(!registry.remove_relay(&stage(), &alice()).await);
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let (registry, _, connector) = registry();

        let result = registry.set_delay(stage(), alice(), 10_001, false).await;
        assert!(matches!(result, Err(Error::InvalidDelay { requested: 10_001, max: 10_000 })));

        let result = registry.set_delay(stage(), ParticipantIdentity::from("relay-bob"), 500, false).await;
        assert!(matches!(result, Err(Error::InvalidParticipant(_))));

        let result = registry.set_delay(stage(), ParticipantIdentity::from(""), 500, false).await;
        assert!(matches!(result, Err(Error::InvalidParticipant(_))));

        assert_eq!(connector.connect_count(), 0);
        assert_eq!(registry.relay_count(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_not_registered() {
        let (registry, _, connector) = registry();
        connector.set_connect_fails(true);

        let err = registry.set_delay(stage(), alice(), 500, false).await.unwrap_err();
        assert!(err.is_start_failure());
        assert_eq!(registry.relay_count(), 0);
        assert_eq!(registry.room_count(), 0);

        connector.set_connect_fails(false);
        assert!(registry.set_delay(stage(), alice(), 500, false).await.unwrap().active);
    }

    #[tokio::test]
    async fn test_concurrent_requests_create_one_relay() {
        let (registry, _, connector) = registry();

        let (a, b) = tokio::join!(
            registry.set_delay(stage(), alice(), 500, false),
            registry.set_delay(stage(), alice(), 700, false),
        );
        assert!(a.unwrap().active);
        assert!(b.unwrap().active);

        assert_eq!(connector.connect_count(), 1);
        assert_eq!(registry.relay_count(), 1);
        assert!(registry.creation_locks.is_empty());
    }

    #[tokio::test]
    async fn test_rooms_are_independent() {
        let (registry, _, _) = registry();

        registry.set_delay(stage(), alice(), 500, false).await.unwrap();
        registry.set_delay(RoomId::from("backstage"), alice(), 300, false).await.unwrap();
        assert_eq!(registry.room_count(), 2);

        assert!(registry.remove_relay(&stage(), &alice()).await);
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.status(&RoomId::from("backstage")).get(&alice()), Some(&300));
    }

    #[tokio::test]
    async fn test_dead_session_pruned_and_replaced() {
        let (registry, _, connector) = registry();
        registry.set_delay(stage(), alice(), 500, false).await.unwrap();

        connector.send(
            "relay-alice",
            SessionEvent::Disconnected {
                reason: "signal lost".to_string(),
            },
        );
        settle().await;

        assert!(registry.status(&stage()).is_empty(), "stopped relays are not reported");
        assert_eq!(registry.prune_stopped().await, 1);
        assert_eq!(registry.room_count(), 0);

        registry.set_delay(stage(), alice(), 500, false).await.unwrap();
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_and_participants() {
        let (registry, _, _) = registry();
        registry.set_delay(stage(), alice(), 250, false).await.unwrap();

        let snapshot = registry.snapshot(&stage(), &alice()).unwrap();
        assert_eq!(snapshot.relay_identity.as_str(), "relay-alice");
        assert_eq!(snapshot.delay_ms, 250);
        assert_eq!(snapshot.track_ids.len(), 2);
        assert!(registry.snapshot(&stage(), &ParticipantIdentity::from("bob")).is_none());

        let participants = registry.participants(&stage()).await.unwrap();
        let names: Vec<_> = participants.iter().map(|p| p.identity.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (registry, _, connector) = registry();
        registry.set_delay(stage(), alice(), 500, false).await.unwrap();
        registry
            .set_delay(stage(), ParticipantIdentity::from("bob"), 500, false)
            .await
            .unwrap();

        registry.shutdown().await;
        assert_eq!(registry.relay_count(), 0);
        assert!(connector.session("relay-alice").unwrap().is_closed());
        assert!(connector.session("relay-bob").unwrap().is_closed());
    }
}
