use async_trait::async_trait;
use ulid::Ulid;

use crate::cache::StatusSource;
use crate::model::*;

use super::conflict::{ensure_bookable, find_conflicts, ConflictCheck};
use super::{Engine, EngineError};

/// What `rs` looks like at `now`. Relies on confirmed bookings never
/// overlapping: at most one of them can contain `now`.
pub(crate) fn snapshot_at(rs: &RoomState, now: Timestamp) -> StatusSnapshot {
    if !rs.room.active {
        return StatusSnapshot {
            occupancy: Occupancy::OutOfService,
            current_booking_id: None,
            next_change: None,
        };
    }

    let idx = rs.bookings.partition_point(|b| b.start_time <= now);
    match idx.checked_sub(1).map(|i| &rs.bookings[i]) {
        Some(current) if current.end_time > now => {
            // Busy until the end of the back-to-back run starting here.
            let mut busy_until = current.end_time;
            for next in &rs.bookings[idx..] {
                if next.start_time != busy_until {
                    break;
                }
                busy_until = next.end_time;
            }
            StatusSnapshot {
                occupancy: Occupancy::Booked,
                current_booking_id: Some(current.id),
                next_change: Some(busy_until),
            }
        }
        _ => StatusSnapshot {
            occupancy: Occupancy::Available,
            current_booking_id: None,
            next_change: rs.bookings.get(idx).map(|b| b.start_time),
        },
    }
}

impl Engine {
    pub fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.bookings
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::BookingNotFound(id))
    }

    pub async fn get_room(&self, room_id: Ulid) -> Result<Room, EngineError> {
        let guard = self.read_room(room_id).await?;
        Ok(guard.room.clone())
    }

    /// Rooms matching `filter`, sorted by name.
    pub async fn list_rooms(&self, filter: &RoomFilter) -> Result<Vec<Room>, EngineError> {
        let ids: Vec<Ulid> = self.rooms.iter().map(|e| *e.key()).collect();
        let mut rooms = Vec::new();
        for id in ids {
            match self.read_room(id).await {
                Ok(guard) if filter.matches(&guard.room) => rooms.push(guard.room.clone()),
                Ok(_) => continue,
                // deleted since we listed the keys
                Err(EngineError::RoomNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rooms)
    }

    /// Confirmed bookings in `room_id` overlapping `span`, minus `exclude`.
    pub async fn find_overlapping(
        &self,
        room_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        let guard = self.read_room(room_id).await?;
        Ok(guard
            .overlapping(&span)
            .filter(|b| b.is_confirmed() && Some(b.id) != exclude)
            .cloned()
            .collect())
    }

    /// Read-only conflict check. Fails for unknown or inactive rooms.
    pub async fn detect_conflicts(
        &self,
        room_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<ConflictCheck, EngineError> {
        let guard = self.read_room(room_id).await?;
        ensure_bookable(&guard.room)?;
        Ok(find_conflicts(&guard, &span, exclude))
    }

    /// Confirmed bookings for a room, optionally limited to a window.
    pub async fn room_bookings(
        &self,
        room_id: Ulid,
        window: Option<Span>,
    ) -> Result<Vec<Booking>, EngineError> {
        let guard = self.read_room(room_id).await?;
        Ok(match window {
            Some(w) => guard.overlapping(&w).cloned().collect(),
            None => guard.bookings.clone(),
        })
    }

    /// Every booking in the store, cancelled ones included, by start time.
    pub fn all_bookings(&self) -> Vec<Booking> {
        let mut out: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|b| (b.start_time, b.id));
        out
    }

    /// Every booking a requester ever made, cancelled ones included.
    pub fn requester_bookings(&self, requester_id: Ulid) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| e.value().requester_id == requester_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| b.start_time);
        out
    }

    pub async fn compute_status(&self, room_id: Ulid, now: Timestamp) -> Result<StatusSnapshot, EngineError> {
        let guard = self.read_room(room_id).await?;
        Ok(snapshot_at(&guard, now))
    }
}

#[async_trait]
impl StatusSource for Engine {
    async fn room_status(&self, room_id: Ulid, now: Timestamp) -> Result<StatusSnapshot, EngineError> {
        self.compute_status(room_id, now).await
    }
}
