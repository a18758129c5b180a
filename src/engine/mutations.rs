use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{ensure_bookable, find_conflicts};
use super::{Engine, EngineError, LockedRooms, WalCommand};

/// A reschedule's result: the room the booking left plus its new form.
#[derive(Debug, Clone)]
pub struct Moved {
    pub from_room_id: Ulid,
    pub booking: Booking,
}

fn validate_room(room: &Room) -> Result<(), EngineError> {
    if room.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    if room.location.len() > MAX_LOCATION_LEN {
        return Err(EngineError::LimitExceeded("room location too long"));
    }
    if room.equipment.len() > MAX_EQUIPMENT_ITEMS {
        return Err(EngineError::LimitExceeded("too many equipment items"));
    }
    Ok(())
}

impl Engine {
    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(&self, room: Room) -> Result<Room, EngineError> {
        validate_room(&room)?;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        let _gate = self.commit_gate.read().await;
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::RoomAlreadyExists(room.id));
        }

        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        self.rooms
            .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        info!(room_id = %room.id, name = %room.name, "room created");
        Ok(room)
    }

    pub async fn update_room(&self, room: Room) -> Result<Room, EngineError> {
        validate_room(&room)?;
        let mut locked = self.lock_rooms(&[room.id]).await?;
        let event = Event::RoomUpdated { room: room.clone() };
        self.persist_and_apply(&event, &mut locked).await?;
        info!(room_id = %room.id, active = room.active, "room updated");
        Ok(room)
    }

    /// Refused while the room still has confirmed bookings.
    pub async fn delete_room(&self, room_id: Ulid) -> Result<Room, EngineError> {
        let locked = self.lock_rooms(&[room_id]).await?;
        let rs = locked
            .get(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        if !rs.bookings.is_empty() {
            return Err(EngineError::RoomHasBookings(room_id));
        }
        let room = rs.room.clone();

        let event = Event::RoomDeleted { id: room_id };
        self.wal_append(&event).await?;
        // Removed while the write lock is still held: anyone queued behind us
        // sees the room gone once they get in.
        self.rooms.remove(&room_id);
        drop(locked);
        info!(room_id = %room_id, "room deleted");
        Ok(room)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Persist a booking the caller has already conflict-checked under
    /// `locked`. Only the id is checked here.
    async fn insert_locked(&self, locked: &mut LockedRooms, booking: Booking) -> Result<Booking, EngineError> {
        if self.bookings.contains_key(&booking.id) {
            return Err(EngineError::DuplicateId(booking.id));
        }
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&event, locked).await?;
        Ok(booking)
    }

    /// Check-then-insert under the room's write lock, so no conflicting
    /// booking can land between the check and the write.
    pub async fn insert_if_no_conflict(
        &self,
        id: Ulid,
        room_id: Ulid,
        requester_id: Ulid,
        span: Span,
    ) -> Result<Booking, EngineError> {
        let mut locked = self.lock_rooms(&[room_id]).await?;
        let rs = locked
            .get(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        ensure_bookable(&rs.room)?;
        if rs.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        find_conflicts(rs, &span, None).into_result()?;

        let booking = Booking {
            id,
            room_id,
            requester_id,
            start_time: span.start,
            end_time: span.end,
            status: BookingStatus::Confirmed,
            created_at: self.clock.now(),
            cancelled_at: None,
            cancelled_by: None,
        };
        let booking = self.insert_locked(&mut locked, booking).await?;
        debug!(booking_id = %id, room_id = %room_id, "booking committed");
        Ok(booking)
    }

    /// Mark a booking cancelled. The record stays in the store.
    pub async fn cancel(&self, booking_id: Ulid, actor: Ulid) -> Result<Booking, EngineError> {
        let room_id = {
            let b = self
                .bookings
                .get(&booking_id)
                .ok_or(EngineError::BookingNotFound(booking_id))?;
            if !b.is_confirmed() {
                return Err(EngineError::AlreadyCancelled(booking_id));
            }
            b.room_id
        };

        let mut locked = self.lock_rooms(&[room_id]).await?;
        // Re-read under the lock: a concurrent cancel or move may have won.
        let current = self.get_booking(booking_id)?;
        if !current.is_confirmed() {
            return Err(EngineError::AlreadyCancelled(booking_id));
        }
        if current.room_id != room_id {
            return Err(EngineError::Busy(room_id));
        }

        let event = Event::BookingCancelled {
            id: booking_id,
            room_id,
            cancelled_at: self.clock.now(),
            cancelled_by: actor,
        };
        self.persist_and_apply(&event, &mut locked).await?;
        drop(locked);
        debug!(booking_id = %booking_id, room_id = %room_id, "booking cancelled");
        self.get_booking(booking_id)
    }

    /// Move a confirmed booking to a new interval, and optionally a new room.
    /// Both rooms are locked (in id order) for the duration.
    pub async fn reschedule(
        &self,
        booking_id: Ulid,
        new_room_id: Option<Ulid>,
        span: Span,
    ) -> Result<Moved, EngineError> {
        let from_room_id = {
            let b = self
                .bookings
                .get(&booking_id)
                .ok_or(EngineError::BookingNotFound(booking_id))?;
            if !b.is_confirmed() {
                return Err(EngineError::AlreadyCancelled(booking_id));
            }
            b.room_id
        };
        let to_room_id = new_room_id.unwrap_or(from_room_id);

        let mut locked = self.lock_rooms(&[from_room_id, to_room_id]).await?;
        let current = self.get_booking(booking_id)?;
        if !current.is_confirmed() {
            return Err(EngineError::AlreadyCancelled(booking_id));
        }
        if current.room_id != from_room_id {
            return Err(EngineError::Busy(from_room_id));
        }

        let target = locked
            .get(&to_room_id)
            .ok_or(EngineError::RoomNotFound(to_room_id))?;
        ensure_bookable(&target.room)?;
        if to_room_id != from_room_id && target.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        find_conflicts(target, &span, Some(booking_id)).into_result()?;

        let event = Event::BookingRescheduled {
            id: booking_id,
            from_room_id,
            to_room_id,
            span,
        };
        self.persist_and_apply(&event, &mut locked).await?;
        drop(locked);
        debug!(booking_id = %booking_id, from = %from_room_id, to = %to_room_id, "booking rescheduled");
        Ok(Moved {
            from_room_id,
            booking: self.get_booking(booking_id)?,
        })
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that rebuilds current state:
    /// every room, then every booking in its final form.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive: no commit can land between the snapshot and the swap.
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::with_capacity(self.rooms.len() + self.bookings.len());
        let states: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in states {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
        }
        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        events.extend(bookings.into_iter().map(|booking| Event::BookingCreated { booking }));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
