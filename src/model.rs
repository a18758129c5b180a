use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// UTC instant. The only time type; naive timestamps never get this far.
pub type Timestamp = DateTime<Utc>;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Span {
    /// The only checked way in: `start == end` and inverted spans are
    /// `InvalidInterval`.
    pub fn try_new(start: Timestamp, end: Timestamp) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Touching spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Timestamp) -> bool {
        self.start <= t && t < self.end
    }
}

/// Reference data owned by the room collaborator. The scheduler only checks
/// existence and `active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub location: String,
    pub equipment: Vec<String>,
    pub active: bool,
}

/// Room search. Empty fields match everything; inactive rooms are hidden
/// unless asked for.
#[derive(Debug, Clone, Default)]
pub struct RoomFilter {
    /// Seats at least this many.
    pub min_capacity: Option<u32>,
    /// Case-insensitive substring of the location.
    pub location: Option<String>,
    /// Every listed item must be present.
    pub equipment: Vec<String>,
    pub include_inactive: bool,
}

impl RoomFilter {
    pub fn matches(&self, room: &Room) -> bool {
        if !self.include_inactive && !room.active {
            return false;
        }
        if self.min_capacity.is_some_and(|min| room.capacity < min) {
            return false;
        }
        if let Some(loc) = &self.location
            && !room.location.to_lowercase().contains(&loc.to_lowercase())
        {
            return false;
        }
        self.equipment.iter().all(|item| room.equipment.contains(item))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub requester_id: Ulid,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub status: BookingStatus,
    pub created_at: Timestamp,
    pub cancelled_at: Option<Timestamp>,
    pub cancelled_by: Option<Ulid>,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span {
            start: self.start_time,
            end: self.end_time,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// A room plus its confirmed bookings. One of these sits behind each
/// per-room lock.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Confirmed bookings only, sorted by `start_time`.
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by start_time.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.start_time, |b| b.start_time)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Remove booking by id.
    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .bookings
            .partition_point(|b| b.start_time < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.end_time > query.start)
    }
}

/// What a room looks like right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occupancy {
    Available,
    Booked,
    OutOfService,
}

/// Status computed from the booking store at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub occupancy: Occupancy,
    pub current_booking_id: Option<Ulid>,
    /// End of the current busy run when booked, start of the next booking
    /// when available.
    pub next_change: Option<Timestamp>,
}

/// A cached status as served to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStatus {
    pub room_id: Ulid,
    #[serde(flatten)]
    pub snapshot: StatusSnapshot,
    pub computed_at: Timestamp,
    pub expires_at: Timestamp,
}

/// Flat event records. This is the WAL record format and
/// what the notify hub broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    RoomDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        room_id: Ulid,
        cancelled_at: Timestamp,
        cancelled_by: Ulid,
    },
    BookingRescheduled {
        id: Ulid,
        from_room_id: Ulid,
        to_room_id: Ulid,
        span: Span,
    },
}

impl Event {
    /// Short name used in logs and notifications.
    pub fn name(&self) -> &'static str {
        match self {
            Event::RoomCreated { .. } => "room_created",
            Event::RoomUpdated { .. } => "room_updated",
            Event::RoomDeleted { .. } => "room_deleted",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingCancelled { .. } => "booking_cancelled",
            Event::BookingRescheduled { .. } => "booking_rescheduled",
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    /// 2030-01-07 00:00 UTC plus `minutes`.
    pub fn at(minutes: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2030, 1, 7, 0, 0, 0).unwrap() + TimeDelta::minutes(minutes)
    }

    pub fn span(start_min: i64, end_min: i64) -> Span {
        Span::try_new(at(start_min), at(end_min)).unwrap()
    }

    pub fn room(name: &str) -> Room {
        Room {
            id: Ulid::new(),
            name: name.into(),
            capacity: 8,
            location: "HQ-2".into(),
            equipment: vec!["projector".into()],
            active: true,
        }
    }

    pub fn booking(room_id: Ulid, start_min: i64, end_min: i64) -> Booking {
        Booking {
            id: Ulid::new(),
            room_id,
            requester_id: Ulid::new(),
            start_time: at(start_min),
            end_time: at(end_min),
            status: BookingStatus::Confirmed,
            created_at: at(0),
            cancelled_at: None,
            cancelled_by: None,
        }
    }
}
