use chrono::TimeDelta;
use ulid::Ulid;

use crate::limits;
use crate::model::*;

use super::EngineError;

fn check_bounds(start: Timestamp, end: Timestamp, widest: TimeDelta) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end)?;
    if !limits::in_valid_range(start) || !limits::in_valid_range(end) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration() > widest {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// Validate a booking interval. Runs before any overlap check.
pub fn validate_span(start: Timestamp, end: Timestamp) -> Result<Span, EngineError> {
    check_bounds(start, end, limits::max_span_duration())
}

/// Validate a read-only query window; allowed to be wider than a booking.
pub fn validate_window(start: Timestamp, end: Timestamp) -> Result<Span, EngineError> {
    check_bounds(start, end, limits::max_query_window())
}

/// A room must be active to accept bookings or answer conflict checks.
pub(crate) fn ensure_bookable(room: &Room) -> Result<(), EngineError> {
    if !room.active {
        return Err(EngineError::RoomInactive(room.id));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictCheck {
    NoConflict,
    Conflict(Vec<Ulid>),
}

impl ConflictCheck {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ConflictCheck::Conflict(_))
    }

    pub fn conflicting_ids(&self) -> &[Ulid] {
        match self {
            ConflictCheck::NoConflict => &[],
            ConflictCheck::Conflict(ids) => ids,
        }
    }

    pub fn into_result(self) -> Result<(), EngineError> {
        match self {
            ConflictCheck::NoConflict => Ok(()),
            ConflictCheck::Conflict(ids) => Err(EngineError::Conflict(ids)),
        }
    }
}

/// Confirmed bookings in `rs` overlapping `span`, skipping `exclude` (a
/// booking being moved never conflicts with its own old slot).
///
/// Only as good as the lock the caller holds on `rs`: under a read lock the
/// answer may be stale by the time it is returned.
pub fn find_conflicts(rs: &RoomState, span: &Span, exclude: Option<Ulid>) -> ConflictCheck {
    let ids: Vec<Ulid> = rs
        .overlapping(span)
        .filter(|b| b.is_confirmed() && Some(b.id) != exclude)
        .map(|b| b.id)
        .collect();
    if ids.is_empty() {
        ConflictCheck::NoConflict
    } else {
        ConflictCheck::Conflict(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn room_with(bookings: &[(i64, i64)]) -> (RoomState, Vec<Ulid>) {
        let r = room("Aurora");
        let mut rs = RoomState::new(r.clone());
        let mut ids = Vec::new();
        for &(s, e) in bookings {
            let b = booking(r.id, s, e);
            ids.push(b.id);
            rs.insert_booking(b);
        }
        (rs, ids)
    }

    #[test]
    fn rejects_empty_and_inverted_intervals() {
        assert!(matches!(
            validate_span(at(60), at(60)),
            Err(EngineError::InvalidInterval { .. })
        ));
        assert!(matches!(
            validate_span(at(120), at(60)),
            Err(EngineError::InvalidInterval { .. })
        ));
        assert_eq!(validate_span(at(60), at(120)).unwrap(), span(60, 120));
    }

    #[test]
    fn rejects_out_of_range_and_too_wide() {
        let ancient = Utc.with_ymd_and_hms(1990, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            validate_span(ancient, at(0)),
            Err(EngineError::LimitExceeded(_))
        ));
        let too_long = at(0) + limits::max_span_duration() + TimeDelta::minutes(1);
        assert!(matches!(
            validate_span(at(0), too_long),
            Err(EngineError::LimitExceeded("span too wide"))
        ));
        // the same width is fine as a query window
        assert!(validate_window(at(0), too_long).is_ok());
    }

    #[test]
    fn detects_overlap() {
        let (rs, ids) = room_with(&[(600, 660)]);
        assert_eq!(
            find_conflicts(&rs, &span(630, 690), None),
            ConflictCheck::Conflict(vec![ids[0]])
        );
    }

    #[test]
    fn back_to_back_is_free() {
        let (rs, _) = room_with(&[(600, 660), (720, 780)]);
        assert_eq!(find_conflicts(&rs, &span(660, 720), None), ConflictCheck::NoConflict);
    }

    #[test]
    fn reports_every_conflict() {
        let (rs, ids) = room_with(&[(540, 600), (600, 660), (700, 760), (900, 960)]);
        let check = find_conflicts(&rs, &span(570, 720), None);
        assert_eq!(check.conflicting_ids(), &ids[..3]);
    }

    #[test]
    fn exclusion_skips_own_booking() {
        let (rs, ids) = room_with(&[(600, 660)]);
        assert_eq!(
            find_conflicts(&rs, &span(630, 690), Some(ids[0])),
            ConflictCheck::NoConflict
        );
    }

    #[test]
    fn cancelled_bookings_never_conflict() {
        let r = room("Aurora");
        let mut rs = RoomState::new(r.clone());
        let mut b = booking(r.id, 600, 660);
        b.status = BookingStatus::Cancelled;
        rs.insert_booking(b);
        assert_eq!(find_conflicts(&rs, &span(600, 660), None), ConflictCheck::NoConflict);
    }

    #[test]
    fn inactive_room_not_bookable() {
        let mut r = room("Aurora");
        assert!(ensure_bookable(&r).is_ok());
        r.active = false;
        assert!(matches!(ensure_bookable(&r), Err(EngineError::RoomInactive(_))));
    }

    #[test]
    fn conflict_into_result() {
        let id = Ulid::new();
        assert!(ConflictCheck::NoConflict.into_result().is_ok());
        match ConflictCheck::Conflict(vec![id]).into_result() {
            Err(EngineError::Conflict(ids)) => assert_eq!(ids, vec![id]),
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
