//! TTL cache of per-room status.
//!
//! Entries are derived data: the booking store stays authoritative and a
//! failed recompute is never cached. Every slot carries a generation that
//! `invalidate` bumps; a recompute only installs its result if the generation
//! it started under is still current, so a slow read racing a write can't
//! resurrect pre-write state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;
use ulid::Ulid;

use crate::clock::Clock;
use crate::engine::EngineError;
use crate::model::{RoomStatus, StatusSnapshot, Timestamp};
use crate::observability;

/// Where the cache recomputes from.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn room_status(&self, room_id: Ulid, now: Timestamp) -> Result<StatusSnapshot, EngineError>;
}

#[derive(Debug, Default)]
struct Slot {
    entry: Option<RoomStatus>,
    generation: u64,
}

pub struct AvailabilityCache {
    slots: DashMap<Ulid, Slot>,
    /// One refill at a time per room; concurrent misses wait and reuse it.
    refills: DashMap<Ulid, Arc<Mutex<()>>>,
    ttl: TimeDelta,
    clock: Arc<dyn Clock>,
    source: Arc<dyn StatusSource>,
}

impl AvailabilityCache {
    pub fn new(source: Arc<dyn StatusSource>, clock: Arc<dyn Clock>, ttl: TimeDelta) -> Self {
        Self {
            slots: DashMap::new(),
            refills: DashMap::new(),
            ttl,
            clock,
            source,
        }
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    /// Cached status if fresh, otherwise recompute. `force_refresh` always
    /// recomputes.
    pub async fn get_status(&self, room_id: Ulid, force_refresh: bool) -> Result<RoomStatus, EngineError> {
        if !force_refresh && let Some(hit) = self.fresh_entry(room_id) {
            metrics::counter!(observability::CACHE_HITS_TOTAL).increment(1);
            return Ok(hit);
        }
        metrics::counter!(observability::CACHE_MISSES_TOTAL).increment(1);

        let refill = self.refills.entry(room_id).or_default().value().clone();
        let result = {
            let _refilling = refill.lock().await;
            self.refill(room_id, force_refresh).await
        };
        if result.is_err() {
            // Unknown and deleted rooms land here; keep nothing for them.
            drop(refill);
            self.slots.remove_if(&room_id, |_, slot| slot.entry.is_none());
            self.refills
                .remove_if(&room_id, |_, lock| Arc::strong_count(lock) == 1);
        }
        result
    }

    /// Runs under the room's refill lock.
    async fn refill(&self, room_id: Ulid, force_refresh: bool) -> Result<RoomStatus, EngineError> {
        if !force_refresh && let Some(hit) = self.fresh_entry(room_id) {
            debug!(room_id = %room_id, "status refilled by a concurrent reader");
            return Ok(hit);
        }

        // The slot exists before the read starts, so an invalidation landing
        // mid-read always has a generation to bump.
        let generation = self.slots.entry(room_id).or_default().generation;
        let now = self.clock.now();
        match self.source.room_status(room_id, now).await {
            Ok(snapshot) => {
                let status = RoomStatus {
                    room_id,
                    snapshot,
                    computed_at: now,
                    expires_at: now + self.ttl,
                };
                self.install(room_id, generation, status.clone());
                Ok(status)
            }
            Err(e) => {
                self.drop_entry(room_id);
                Err(e)
            }
        }
    }

    /// Drop the room's entry and fence off any recompute already in flight.
    /// Never waits on readers. A room with no slot has nothing cached and no
    /// recompute running, so nothing is created for it.
    pub fn invalidate(&self, room_id: Ulid) {
        metrics::counter!(observability::CACHE_INVALIDATIONS_TOTAL).increment(1);
        if let Some(mut slot) = self.slots.get_mut(&room_id) {
            slot.generation += 1;
            slot.entry = None;
            debug!(room_id = %room_id, generation = slot.generation, "status invalidated");
        }
    }

    /// Release everything held for a deleted room. A recompute still in
    /// flight finds no slot and is discarded.
    pub fn forget(&self, room_id: Ulid) {
        self.slots.remove(&room_id);
        self.refills.remove(&room_id);
    }

    /// Drop every expired entry. Returns how many went.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut evicted = 0;
        self.slots.retain(|_, slot| {
            let expired = slot.entry.as_ref().is_some_and(|e| e.expires_at <= now);
            if expired {
                evicted += 1;
            }
            !expired
        });
        self.refills
            .retain(|room_id, lock| self.slots.contains_key(room_id) || Arc::strong_count(lock) > 1);
        evicted
    }

    /// Number of rooms with a cached entry (fresh or not yet swept).
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rooms with any bookkeeping at all: slots and refill locks.
    #[cfg(test)]
    pub(crate) fn tracked(&self) -> (usize, usize) {
        (self.slots.len(), self.refills.len())
    }

    fn fresh_entry(&self, room_id: Ulid) -> Option<RoomStatus> {
        let now = self.clock.now();
        self.slots
            .get(&room_id)
            .and_then(|slot| slot.entry.clone())
            .filter(|e| now < e.expires_at)
    }

    fn install(&self, room_id: Ulid, generation: u64, status: RoomStatus) {
        match self.slots.get_mut(&room_id) {
            Some(mut slot) if slot.generation == generation => slot.entry = Some(status),
            _ => debug!(room_id = %room_id, "discarding status computed before an invalidation"),
        }
    }

    fn drop_entry(&self, room_id: Ulid) {
        if let Some(mut slot) = self.slots.get_mut(&room_id) {
            slot.entry = None;
        }
    }
}
