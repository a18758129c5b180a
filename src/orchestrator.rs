//! Single entry point for booking writes: check+commit, then cache
//! invalidation, then the change notification.
//!
//! Each write runs inside a spawned task. If the caller's future is dropped
//! (client went away) the task still finishes, so a committed booking always
//! gets its cache entry invalidated.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::cache::AvailabilityCache;
use crate::engine::{validate_span, validate_window, ConflictCheck, Engine, EngineError};
use crate::model::{Booking, Event, Room, RoomStatus, Timestamp};
use crate::notify::NotifyHub;
use crate::observability;

/// Attempts per write before `Busy` is surfaced.
pub const MAX_ATTEMPTS: u32 = 2;

enum Attempt<T> {
    Done(Result<T, EngineError>),
    Retry(EngineError),
}

/// Run `op` up to `MAX_ATTEMPTS` times, repeating only on lock timeouts.
async fn retrying<T, F, Fut>(label: &'static str, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 1;
    loop {
        let outcome = match op().await {
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => Attempt::Retry(e),
            other => Attempt::Done(other),
        };
        match outcome {
            Attempt::Done(result) => return result,
            Attempt::Retry(e) => {
                debug!(op = label, attempt, "retrying after: {e}");
                metrics::counter!(observability::WRITE_RETRIES_TOTAL, "op" => label).increment(1);
                attempt += 1;
            }
        }
    }
}

fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(EngineError::Conflict(_)) => "conflict",
        Err(EngineError::Busy(_)) => "busy",
        Err(e) if e.is_validation() => "invalid",
        Err(EngineError::Storage(_) | EngineError::Aborted(_)) => "error",
        Err(_) => "rejected",
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<Engine>,
    cache: Arc<AvailabilityCache>,
    notify: Arc<NotifyHub>,
}

impl Orchestrator {
    pub fn new(engine: Arc<Engine>, cache: Arc<AvailabilityCache>, notify: Arc<NotifyHub>) -> Self {
        Self {
            engine,
            cache,
            notify,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<AvailabilityCache> {
        &self.cache
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    /// Drive `fut` to completion on its own task regardless of whether the
    /// caller keeps polling.
    async fn detached<T, Fut>(&self, label: &'static str, fut: Fut) -> Result<T, EngineError>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let result = tokio::spawn(fut)
            .await
            .unwrap_or_else(|e| Err(EngineError::Aborted(e.to_string())));
        metrics::counter!(
            observability::BOOKING_OPS_TOTAL,
            "op" => label,
            "outcome" => outcome_label(&result)
        )
        .increment(1);
        if let Err(EngineError::Busy(room_id)) = &result {
            warn!(op = label, room_id = %room_id, "gave up after {MAX_ATTEMPTS} attempts");
        }
        result
    }

    /// Invalidate first so a subscriber reacting to the event never reads
    /// pre-write status.
    fn after_commit(&self, room_ids: &[Ulid], event: &Event) {
        for room_id in room_ids {
            self.cache.invalidate(*room_id);
        }
        for room_id in room_ids {
            self.notify.send(*room_id, event);
        }
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn create_booking(
        &self,
        room_id: Ulid,
        requester_id: Ulid,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Booking, EngineError> {
        let span = validate_span(start, end)?;
        let this = self.clone();
        self.detached("create_booking", async move {
            let id = Ulid::new();
            let booking = retrying("create_booking", || {
                this.engine.insert_if_no_conflict(id, room_id, requester_id, span)
            })
            .await?;
            this.after_commit(&[room_id], &Event::BookingCreated {
                booking: booking.clone(),
            });
            info!(booking_id = %booking.id, room_id = %room_id, requester_id = %requester_id, "booking created");
            Ok(booking)
        })
        .await
    }

    /// The caller is already authorized to cancel on behalf of `actor`.
    pub async fn cancel_booking(&self, booking_id: Ulid, actor: Ulid) -> Result<Booking, EngineError> {
        let this = self.clone();
        self.detached("cancel_booking", async move {
            let booking = retrying("cancel_booking", || this.engine.cancel(booking_id, actor)).await?;
            this.cache.invalidate(booking.room_id);
            if let (Some(cancelled_at), Some(cancelled_by)) = (booking.cancelled_at, booking.cancelled_by) {
                this.notify.send(
                    booking.room_id,
                    &Event::BookingCancelled {
                        id: booking.id,
                        room_id: booking.room_id,
                        cancelled_at,
                        cancelled_by,
                    },
                );
            }
            info!(booking_id = %booking_id, room_id = %booking.room_id, actor = %actor, "booking cancelled");
            Ok(booking)
        })
        .await
    }

    /// Move a confirmed booking to `[start, end)`, optionally into another room.
    pub async fn reschedule_booking(
        &self,
        booking_id: Ulid,
        new_room_id: Option<Ulid>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Booking, EngineError> {
        let span = validate_span(start, end)?;
        let this = self.clone();
        self.detached("reschedule_booking", async move {
            let moved = retrying("reschedule_booking", || {
                this.engine.reschedule(booking_id, new_room_id, span)
            })
            .await?;
            let to_room_id = moved.booking.room_id;
            let event = Event::BookingRescheduled {
                id: booking_id,
                from_room_id: moved.from_room_id,
                to_room_id,
                span,
            };
            if moved.from_room_id == to_room_id {
                this.after_commit(&[to_room_id], &event);
            } else {
                this.after_commit(&[moved.from_room_id, to_room_id], &event);
            }
            info!(booking_id = %booking_id, room_id = %to_room_id, "booking rescheduled");
            Ok(moved.booking)
        })
        .await
    }

    /// Exact range check straight against the store; never served from cache.
    pub async fn check_availability(
        &self,
        room_id: Ulid,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<ConflictCheck, EngineError> {
        let window = validate_window(start, end)?;
        self.engine.detect_conflicts(room_id, window, None).await
    }

    pub async fn get_status(&self, room_id: Ulid, force_refresh: bool) -> Result<RoomStatus, EngineError> {
        self.cache.get_status(room_id, force_refresh).await
    }

    /// Hook for anything that changes a room outside this type.
    pub fn invalidate_availability(&self, room_id: Ulid) {
        self.cache.invalidate(room_id);
    }

    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(&self, room: Room) -> Result<Room, EngineError> {
        let this = self.clone();
        self.detached("create_room", async move {
            let room = this.engine.create_room(room).await?;
            this.after_commit(&[room.id], &Event::RoomCreated { room: room.clone() });
            Ok(room)
        })
        .await
    }

    pub async fn update_room(&self, room: Room) -> Result<Room, EngineError> {
        let this = self.clone();
        self.detached("update_room", async move {
            let room = retrying("update_room", || this.engine.update_room(room.clone())).await?;
            this.after_commit(&[room.id], &Event::RoomUpdated { room: room.clone() });
            Ok(room)
        })
        .await
    }

    pub async fn delete_room(&self, room_id: Ulid) -> Result<Room, EngineError> {
        let this = self.clone();
        self.detached("delete_room", async move {
            let room = retrying("delete_room", || this.engine.delete_room(room_id)).await?;
            this.after_commit(&[room_id], &Event::RoomDeleted { id: room_id });
            this.cache.forget(room_id);
            this.notify.remove(&room_id);
            Ok(room)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::model::fixtures::*;
    use crate::model::Occupancy;
    use chrono::TimeDelta;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_orchestrator");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn setup(name: &str, clock: Arc<ManualClock>) -> Orchestrator {
        let engine = Arc::new(
            Engine::new(test_wal_path(name), Duration::from_millis(500), clock.clone()).unwrap(),
        );
        let cache = Arc::new(AvailabilityCache::new(
            engine.clone(),
            clock,
            TimeDelta::seconds(60),
        ));
        Orchestrator::new(engine, cache, Arc::new(NotifyHub::new()))
    }

    async fn with_room(orch: &Orchestrator) -> Ulid {
        orch.create_room(room("Aurora")).await.unwrap().id
    }

    #[tokio::test]
    async fn create_then_check_reports_conflict() {
        let orch = setup("create_check.wal", Arc::new(ManualClock::new(at(0))));
        let rid = with_room(&orch).await;
        let b = orch.create_booking(rid, Ulid::new(), at(600), at(660)).await.unwrap();

        let check = orch.check_availability(rid, at(600), at(660)).await.unwrap();
        assert_eq!(check, ConflictCheck::Conflict(vec![b.id]));

        orch.cancel_booking(b.id, b.requester_id).await.unwrap();
        let check = orch.check_availability(rid, at(600), at(660)).await.unwrap();
        assert_eq!(check, ConflictCheck::NoConflict);
    }

    #[tokio::test]
    async fn invalid_interval_rejected_before_store() {
        let orch = setup("invalid.wal", Arc::new(ManualClock::new(at(0))));
        let rid = with_room(&orch).await;
        let err = orch.create_booking(rid, Ulid::new(), at(60), at(60)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInterval { .. }));
        assert!(orch.engine().room_bookings(rid, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_room_is_validation_error() {
        let orch = setup("unknown_room.wal", Arc::new(ManualClock::new(at(0))));
        let err = orch
            .create_booking(Ulid::new(), Ulid::new(), at(60), at(120))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RoomNotFound(_)));
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn back_to_back_bookings_both_succeed() {
        let orch = setup("back_to_back.wal", Arc::new(ManualClock::new(at(0))));
        let rid = with_room(&orch).await;
        orch.create_booking(rid, Ulid::new(), at(600), at(660)).await.unwrap();
        orch.create_booking(rid, Ulid::new(), at(660), at(720)).await.unwrap();
        orch.create_booking(rid, Ulid::new(), at(540), at(600)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_overlapping_creates_yield_one_winner() {
        let orch = setup("concurrent.wal", Arc::new(ManualClock::new(at(0))));
        let rid = with_room(&orch).await;

        let n = 16;
        let tasks: Vec<_> = (0..n)
            .map(|i| {
                let orch = orch.clone();
                // every interval covers [605, 700)
                tokio::spawn(async move {
                    orch.create_booking(rid, Ulid::new(), at(590 + i), at(700)).await
                })
            })
            .collect();

        let mut ok = 0;
        let mut conflicts = 0;
        for t in futures::future::join_all(tasks).await {
            match t.unwrap() {
                Ok(_) => ok += 1,
                Err(EngineError::Conflict(ids)) => {
                    assert_eq!(ids.len(), 1);
                    conflicts += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, n - 1);
    }

    #[tokio::test]
    async fn status_reflects_booking_made_within_ttl() {
        let clock = Arc::new(ManualClock::new(at(600)));
        let orch = setup("status_invalidate.wal", clock.clone());
        let rid = with_room(&orch).await;

        let before = orch.get_status(rid, false).await.unwrap();
        assert_eq!(before.snapshot.occupancy, Occupancy::Available);
        assert_eq!(before.expires_at, clock.now() + TimeDelta::seconds(60));

        clock.advance(TimeDelta::seconds(10));
        let b = orch.create_booking(rid, Ulid::new(), at(600), at(660)).await.unwrap();

        clock.advance(TimeDelta::seconds(1));
        let after = orch.get_status(rid, false).await.unwrap();
        assert_eq!(after.snapshot.occupancy, Occupancy::Booked);
        assert_eq!(after.snapshot.current_booking_id, Some(b.id));
        assert_eq!(after.snapshot.next_change, Some(at(660)));
    }

    #[tokio::test]
    async fn cancel_invalidates_status() {
        let clock = Arc::new(ManualClock::new(at(600)));
        let orch = setup("status_cancel.wal", clock.clone());
        let rid = with_room(&orch).await;
        let b = orch.create_booking(rid, Ulid::new(), at(590), at(660)).await.unwrap();
        assert_eq!(orch.get_status(rid, false).await.unwrap().snapshot.occupancy, Occupancy::Booked);

        orch.cancel_booking(b.id, b.requester_id).await.unwrap();
        assert_eq!(
            orch.get_status(rid, false).await.unwrap().snapshot.occupancy,
            Occupancy::Available
        );
    }

    #[tokio::test]
    async fn room_deactivation_invalidates_status() {
        let orch = setup("status_room.wal", Arc::new(ManualClock::new(at(0))));
        let mut r = orch.create_room(room("Borealis")).await.unwrap();
        assert_eq!(orch.get_status(r.id, false).await.unwrap().snapshot.occupancy, Occupancy::Available);

        r.active = false;
        orch.update_room(r.clone()).await.unwrap();
        assert_eq!(
            orch.get_status(r.id, false).await.unwrap().snapshot.occupancy,
            Occupancy::OutOfService
        );
    }

    #[tokio::test]
    async fn deleted_and_unknown_rooms_release_cache_state() {
        let orch = setup("delete_forget.wal", Arc::new(ManualClock::new(at(0))));
        let rid = with_room(&orch).await;
        orch.get_status(rid, false).await.unwrap();
        orch.delete_room(rid).await.unwrap();

        assert!(matches!(
            orch.get_status(rid, false).await,
            Err(EngineError::RoomNotFound(_))
        ));
        assert!(orch.get_status(Ulid::new(), true).await.is_err());
        assert_eq!(orch.cache().tracked(), (0, 0));
    }

    #[tokio::test]
    async fn events_published_after_commit() {
        let orch = setup("events.wal", Arc::new(ManualClock::new(at(0))));
        let rid = with_room(&orch).await;
        let mut rx = orch.notify().subscribe(rid);

        let b = orch.create_booking(rid, Ulid::new(), at(60), at(120)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Event::BookingCreated { booking: b.clone() });

        let actor = Ulid::new();
        orch.cancel_booking(b.id, actor).await.unwrap();
        match rx.recv().await.unwrap() {
            Event::BookingCancelled { id, cancelled_by, .. } => {
                assert_eq!(id, b.id);
                assert_eq!(cancelled_by, actor);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reschedule_across_rooms_notifies_both() {
        let orch = setup("reschedule_rooms.wal", Arc::new(ManualClock::new(at(0))));
        let a = with_room(&orch).await;
        let b = orch.create_room(room("Borealis")).await.unwrap().id;
        let mut rx_a = orch.notify().subscribe(a);
        let mut rx_b = orch.notify().subscribe(b);

        let booking = orch.create_booking(a, Ulid::new(), at(60), at(120)).await.unwrap();
        rx_a.recv().await.unwrap();

        let moved = orch
            .reschedule_booking(booking.id, Some(b), at(60), at(120))
            .await
            .unwrap();
        assert_eq!(moved.room_id, b);
        assert!(matches!(rx_a.recv().await.unwrap(), Event::BookingRescheduled { .. }));
        assert!(matches!(rx_b.recv().await.unwrap(), Event::BookingRescheduled { .. }));

        assert_eq!(
            orch.check_availability(a, at(60), at(120)).await.unwrap(),
            ConflictCheck::NoConflict
        );
    }

    #[tokio::test]
    async fn retry_repeats_busy_once() {
        let calls = AtomicU32::new(0);
        let result = retrying("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(EngineError::Busy(Ulid::nil()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_surfaces_second_busy() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retrying("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Busy(Ulid::nil())) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::Busy(_))));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn retry_never_repeats_conflict() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retrying("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Conflict(vec![Ulid::nil()])) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
