use thiserror::Error;
use ulid::Ulid;

use crate::model::Timestamp;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid interval: start {start} is not before end {end}")]
    InvalidInterval { start: Timestamp, end: Timestamp },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("room not found: {0}")]
    RoomNotFound(Ulid),

    #[error("room is inactive: {0}")]
    RoomInactive(Ulid),

    #[error("room already exists: {0}")]
    RoomAlreadyExists(Ulid),

    #[error("room {0} still has confirmed bookings")]
    RoomHasBookings(Ulid),

    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),

    #[error("duplicate booking id: {0}")]
    DuplicateId(Ulid),

    #[error("booking already cancelled: {0}")]
    AlreadyCancelled(Ulid),

    #[error("conflicts with confirmed bookings: {0:?}")]
    Conflict(Vec<Ulid>),

    #[error("room {0} is busy, try again")]
    Busy(Ulid),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("operation aborted: {0}")]
    Aborted(String),
}

impl EngineError {
    /// Only lock contention is worth retrying; everything else is a final answer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy(_))
    }

    /// Malformed input or an unusable room.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidInterval { .. }
                | EngineError::LimitExceeded(_)
                | EngineError::RoomNotFound(_)
                | EngineError::RoomInactive(_)
        )
    }
}
