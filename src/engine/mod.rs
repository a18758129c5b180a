mod conflict;
mod error;
mod mutations;
mod queries;

pub use conflict::{find_conflicts, validate_span, validate_window, ConflictCheck};
pub use error::EngineError;
pub use mutations::Moved;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every append that is already queued when the first one is
/// picked up rides in the same fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut deferred: Option<WalCommand> = None;
    loop {
        let cmd = match deferred.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                commit_batch(&mut wal, batch);
            }
            WalCommand::Compact { events, response } => {
                let result = Wal::write_compact_file(wal.path(), &events)
                    .and_then(|()| wal.swap_compact_file());
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        // Every caller in the batch hears "failed", so none of its frames may
        // surface later behind a successful flush.
        warn!(frames = batch.len(), "WAL batch failed, rolling back: {e}");
        if let Err(rollback) = wal.rollback() {
            tracing::error!("WAL rollback failed, refusing further appends: {rollback}");
        }
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Write guards over one or more rooms plus a shared hold on the commit gate.
/// Dropping it releases everything.
pub(super) struct LockedRooms {
    _gate: OwnedRwLockReadGuard<()>,
    guards: Vec<OwnedRwLockWriteGuard<RoomState>>,
}

impl LockedRooms {
    pub(super) fn get(&self, room_id: &Ulid) -> Option<&RoomState> {
        self.guards.iter().find(|g| g.room.id == *room_id).map(|g| &**g)
    }

    pub(super) fn get_mut(&mut self, room_id: &Ulid) -> Option<&mut RoomState> {
        self.guards
            .iter_mut()
            .find(|g| g.room.id == *room_id)
            .map(|g| &mut **g)
    }
}

/// The booking store: source of truth for rooms and bookings.
///
/// Each room's state sits behind its own `RwLock`; that map doubles as the
/// per-room lock registry. Writers for one room are serialized, different
/// rooms proceed in parallel.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    /// Every booking ever created, cancelled ones included.
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Writers hold it shared; compaction holds it exclusively so the
    /// snapshot it writes can't miss a concurrent commit.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) lock_timeout: Duration,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer task. Must be called
    /// inside a tokio runtime.
    pub fn new(wal_path: PathBuf, lock_timeout: Duration, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        Self::start(&wal_path, events, wal, lock_timeout, clock)
    }

    fn start(
        wal_path: &Path,
        events: Vec<Event>,
        wal: Wal,
        lock_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            bookings: DashMap::new(),
            wal_tx,
            commit_gate: Arc::new(RwLock::new(())),
            lock_timeout,
            clock,
        };

        for event in &events {
            engine.replay_event(event)?;
        }
        if !events.is_empty() {
            info!(
                events = events.len(),
                rooms = engine.rooms.len(),
                bookings = engine.bookings.len(),
                "replayed WAL {}",
                wal_path.display()
            );
        }
        Ok(engine)
    }

    /// Nothing else holds these locks during start-up, so `try_write_owned`
    /// always succeeds.
    fn replay_event(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::RoomCreated { room } => {
                self.rooms
                    .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
            }
            Event::RoomDeleted { id } => {
                self.rooms.remove(id);
            }
            other => {
                let mut guards = Vec::new();
                for room_id in event_room_ids(other) {
                    if let Some(rs) = self.get_room_state(&room_id) {
                        let guard = rs
                            .try_write_owned()
                            .map_err(|_| io::Error::other("replay: room lock contended"))?;
                        guards.push(guard);
                    }
                }
                let gate = self
                    .commit_gate
                    .clone()
                    .try_read_owned()
                    .map_err(|_| io::Error::other("replay: commit gate contended"))?;
                let mut locked = LockedRooms { _gate: gate, guards };
                if let Some(ids) = replay_conflict(other, &locked) {
                    warn!(
                        event = other.name(),
                        conflicting = ?ids,
                        "skipping WAL event that would overlap a confirmed booking"
                    );
                    return Ok(());
                }
                self.apply_locked(other, &mut locked);
            }
        }
        Ok(())
    }

    /// Apply a committed event to in-memory state. Room create/delete are
    /// handled at the map level by their callers.
    pub(super) fn apply_locked(&self, event: &Event, locked: &mut LockedRooms) {
        match event {
            Event::RoomUpdated { room } => {
                if let Some(rs) = locked.get_mut(&room.id) {
                    rs.room = room.clone();
                }
            }
            Event::BookingCreated { booking } => {
                if booking.is_confirmed()
                    && let Some(rs) = locked.get_mut(&booking.room_id)
                {
                    rs.insert_booking(booking.clone());
                }
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingCancelled {
                id,
                room_id,
                cancelled_at,
                cancelled_by,
            } => {
                if let Some(rs) = locked.get_mut(room_id) {
                    rs.remove_booking(*id);
                }
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.status = BookingStatus::Cancelled;
                    b.cancelled_at = Some(*cancelled_at);
                    b.cancelled_by = Some(*cancelled_by);
                }
            }
            Event::BookingRescheduled {
                id,
                from_room_id,
                to_room_id,
                span,
            } => {
                if let Some(rs) = locked.get_mut(from_room_id) {
                    rs.remove_booking(*id);
                }
                let updated = self.bookings.get_mut(id).map(|mut b| {
                    b.room_id = *to_room_id;
                    b.start_time = span.start;
                    b.end_time = span.end;
                    b.clone()
                });
                if let Some(b) = updated
                    && b.is_confirmed()
                    && let Some(rs) = locked.get_mut(to_room_id)
                {
                    rs.insert_booking(b);
                }
            }
            Event::RoomCreated { .. } | Event::RoomDeleted { .. } => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| {
                tracing::error!(event = event.name(), "WAL append failed: {e}");
                EngineError::Storage(e.to_string())
            })
    }

    /// WAL-append then apply. Nothing touches memory if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        event: &Event,
        locked: &mut LockedRooms,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_locked(event, locked);
        metrics::counter!(observability::EVENTS_COMMITTED_TOTAL, "event" => event.name())
            .increment(1);
        Ok(())
    }

    pub fn get_room_state(&self, room_id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(room_id).map(|e| e.value().clone())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Take the commit gate (shared) and write locks on `room_ids` in sorted
    /// order, all within `lock_timeout`. Expiry yields `Busy`.
    pub(super) async fn lock_rooms(&self, room_ids: &[Ulid]) -> Result<LockedRooms, EngineError> {
        let mut ids = room_ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut states = Vec::with_capacity(ids.len());
        for id in &ids {
            let rs = self.get_room_state(id).ok_or(EngineError::RoomNotFound(*id))?;
            states.push((*id, rs));
        }

        let gate = self.commit_gate.clone();
        let acquire = async move {
            let gate = gate.read_owned().await;
            let mut guards = Vec::with_capacity(states.len());
            for (_, rs) in states {
                guards.push(rs.write_owned().await);
            }
            LockedRooms { _gate: gate, guards }
        };

        let locked = tokio::time::timeout(self.lock_timeout, acquire)
            .await
            .map_err(|_| {
                let busy = ids.first().copied().unwrap_or_else(Ulid::nil);
                warn!(room_id = %busy, "room lock wait exceeded {:?}", self.lock_timeout);
                metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                EngineError::Busy(busy)
            })?;

        // A room deleted while we queued for its lock is gone for good.
        for id in &ids {
            if !self.rooms.contains_key(id) {
                return Err(EngineError::RoomNotFound(*id));
            }
        }
        Ok(locked)
    }

    /// Shared read access to one room, bounded like the write path.
    pub(super) async fn read_room(
        &self,
        room_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<RoomState>, EngineError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        tokio::time::timeout(self.lock_timeout, rs.read_owned())
            .await
            .map_err(|_| {
                metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                EngineError::Busy(room_id)
            })
    }
}

/// Live commits check conflicts under the room lock; replay re-checks so a
/// log that somehow holds two overlapping bookings can't restore both.
fn replay_conflict(event: &Event, locked: &LockedRooms) -> Option<Vec<Ulid>> {
    let (room_id, span, exclude) = match event {
        Event::BookingCreated { booking } if booking.is_confirmed() => {
            (booking.room_id, booking.span(), None)
        }
        Event::BookingRescheduled { id, to_room_id, span, .. } => (*to_room_id, *span, Some(*id)),
        _ => return None,
    };
    match find_conflicts(locked.get(&room_id)?, &span, exclude) {
        ConflictCheck::Conflict(ids) => Some(ids),
        ConflictCheck::NoConflict => None,
    }
}

/// Rooms whose lock must be held to apply `event`.
fn event_room_ids(event: &Event) -> Vec<Ulid> {
    match event {
        Event::RoomUpdated { room } => vec![room.id],
        Event::BookingCreated { booking } => vec![booking.room_id],
        Event::BookingCancelled { room_id, .. } => vec![*room_id],
        Event::BookingRescheduled {
            from_room_id,
            to_room_id,
            ..
        } if from_room_id == to_room_id => vec![*from_room_id],
        Event::BookingRescheduled {
            from_room_id,
            to_room_id,
            ..
        } => vec![*from_room_id, *to_room_id],
        Event::RoomCreated { .. } | Event::RoomDeleted { .. } => Vec::new(),
    }
}
