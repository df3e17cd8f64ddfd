use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

pub const RESOURCE_ID: &str = "device-001";

/// Injected time source so hold expiry is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Held,
    Confirmed,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservationRecord {
    pub reservation_id: String,
    #[serde(skip)]
    pub session_id: String,
    pub resource_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ReservationStatus,
    #[serde(skip)]
    pub hold_expires_at: Option<DateTime<Utc>>,
}

impl ReservationRecord {
    fn as_json(&self) -> serde_json::Value {
        json!({
            "reservation_id": self.reservation_id,
            "resource_id": self.resource_id,
            "start_time": self.start_time.to_rfc3339(),
            "end_time": self.end_time.to_rfc3339(),
            "status": self.status,
        })
    }
}

#[derive(Default)]
struct SchedulerInner {
    reservations: HashMap<String, ReservationRecord>,
}

/// In-memory mock scheduler: one resource, one-hour slots, time-bounded
/// holds. A free availability check places a hold that lapses after the
/// configured minutes unless confirmed; at most one hold is active per slot.
pub struct MockScheduler {
    clock: std::sync::Arc<dyn Clock>,
    hold_minutes: i64,
    inner: Mutex<SchedulerInner>,
}

impl MockScheduler {
    pub fn new(clock: std::sync::Arc<dyn Clock>, hold_minutes: i64) -> Self {
        Self {
            clock,
            hold_minutes,
            inner: Mutex::new(SchedulerInner::default()),
        }
    }

    fn normalize_slot(start: DateTime<Utc>) -> DateTime<Utc> {
        start
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(start)
    }

    fn expire_lapsed(inner: &mut SchedulerInner, now: DateTime<Utc>) {
        for record in inner.reservations.values_mut() {
            if record.status == ReservationStatus::Held {
                if let Some(expires) = record.hold_expires_at {
                    if expires <= now {
                        tracing::debug!(
                            "[scheduler] hold {} expired at {}",
                            record.reservation_id,
                            expires
                        );
                        record.status = ReservationStatus::Expired;
                        record.hold_expires_at = None;
                    }
                }
            }
        }
    }

    fn find_active_id(inner: &SchedulerInner, slot: DateTime<Utc>) -> Option<String> {
        inner
            .reservations
            .values()
            .find(|r| {
                r.start_time == slot
                    && matches!(
                        r.status,
                        ReservationStatus::Held | ReservationStatus::Confirmed
                    )
            })
            .map(|r| r.reservation_id.clone())
    }

    /// Report availability for the slot containing `start`. A free slot is
    /// answered with a proposal and an internal hold for the asking session;
    /// the hold is never exposed on the wire.
    pub fn check_availability(&self, session_id: &str, start: DateTime<Utc>) -> serde_json::Value {
        let now = self.clock.now();
        let slot = Self::normalize_slot(start);
        let slot_end = slot + Duration::hours(1);
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        Self::expire_lapsed(&mut inner, now);

        if let Some(id) = Self::find_active_id(&inner, slot) {
            let record = inner
                .reservations
                .get_mut(&id)
                .expect("active record exists");
            if record.status == ReservationStatus::Held && record.session_id == session_id {
                // The holder re-checking its own slot refreshes the hold.
                record.hold_expires_at = Some(now + Duration::minutes(self.hold_minutes));
            } else {
                tracing::debug!("[scheduler] slot {} unavailable", slot);
                return json!({
                    "available": false,
                    "reason": "Requested timeslot is already reserved.",
                    "reservation": record.as_json(),
                });
            }
        } else {
            let record = ReservationRecord {
                reservation_id: Uuid::new_v4().simple().to_string(),
                session_id: session_id.to_string(),
                resource_id: RESOURCE_ID.to_string(),
                start_time: slot,
                end_time: slot_end,
                status: ReservationStatus::Held,
                hold_expires_at: Some(now + Duration::minutes(self.hold_minutes)),
            };
            tracing::debug!(
                "[scheduler] hold {} placed on slot {}",
                record.reservation_id,
                slot
            );
            inner
                .reservations
                .insert(record.reservation_id.clone(), record);
        }

        json!({
            "available": true,
            "proposal": {
                "resource_id": RESOURCE_ID,
                "start_time": slot.to_rfc3339(),
                "end_time": slot_end.to_rfc3339(),
            },
        })
    }

    /// Confirm the slot containing `start` for `session_id`, promoting this
    /// session's hold where one exists. Idempotent for the owning session.
    pub fn book_reservation(&self, session_id: &str, start: DateTime<Utc>) -> serde_json::Value {
        let now = self.clock.now();
        let slot = Self::normalize_slot(start);
        let slot_end = slot + Duration::hours(1);
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        Self::expire_lapsed(&mut inner, now);

        if let Some(id) = Self::find_active_id(&inner, slot) {
            let record = inner
                .reservations
                .get_mut(&id)
                .expect("active record exists");
            match record.status {
                ReservationStatus::Confirmed if record.session_id == session_id => {
                    return json!({
                        "action": "confirm",
                        "success": true,
                        "reservation": record.as_json(),
                        "note": "Reservation already confirmed for this session.",
                    });
                }
                ReservationStatus::Confirmed => {
                    return json!({
                        "action": "confirm",
                        "success": false,
                        "reason": "Requested timeslot is already reserved.",
                    });
                }
                ReservationStatus::Held if record.session_id == session_id => {
                    record.status = ReservationStatus::Confirmed;
                    record.hold_expires_at = None;
                    tracing::debug!(
                        "[scheduler] hold {} confirmed for slot {}",
                        record.reservation_id,
                        slot
                    );
                    return json!({
                        "action": "confirm",
                        "success": true,
                        "reservation": record.as_json(),
                    });
                }
                _ => {
                    return json!({
                        "action": "confirm",
                        "success": false,
                        "reason": "Requested timeslot is currently held by another session.",
                    });
                }
            }
        }

        let record = ReservationRecord {
            reservation_id: Uuid::new_v4().simple().to_string(),
            session_id: session_id.to_string(),
            resource_id: RESOURCE_ID.to_string(),
            start_time: slot,
            end_time: slot_end,
            status: ReservationStatus::Confirmed,
            hold_expires_at: None,
        };
        let payload = record.as_json();
        tracing::debug!(
            "[scheduler] reservation {} confirmed for slot {}",
            record.reservation_id,
            slot
        );
        inner
            .reservations
            .insert(record.reservation_id.clone(), record);
        json!({
            "action": "confirm",
            "success": true,
            "reservation": payload,
        })
    }

    /// Cancel a reservation (hold or confirmed). Only the owning session may
    /// cancel; cancelling frees the slot.
    pub fn cancel_reservation(&self, reservation_id: &str, session_id: &str) -> serde_json::Value {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        Self::expire_lapsed(&mut inner, now);

        let record = match inner.reservations.get_mut(reservation_id) {
            Some(r) if r.session_id == session_id => r,
            _ => {
                tracing::debug!("[scheduler] cancel {}: not found for session", reservation_id);
                return json!({
                    "action": "cancel",
                    "success": false,
                    "reason": "Reservation not found for session.",
                });
            }
        };

        match record.status {
            ReservationStatus::Cancelled => json!({
                "action": "cancel",
                "success": false,
                "reason": "Reservation already cancelled.",
                "reservation": record.as_json(),
            }),
            ReservationStatus::Expired => json!({
                "action": "cancel",
                "success": false,
                "reason": "Reservation already expired.",
                "reservation": record.as_json(),
            }),
            ReservationStatus::Held | ReservationStatus::Confirmed => {
                record.status = ReservationStatus::Cancelled;
                record.hold_expires_at = None;
                tracing::debug!("[scheduler] reservation {} cancelled", reservation_id);
                json!({
                    "action": "cancel",
                    "success": true,
                    "reservation": record.as_json(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn fixed_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 25, 2, 30, 0).unwrap()
    }

    fn scheduler_with_clock() -> (MockScheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(fixed_start()));
        let scheduler = MockScheduler::new(clock.clone(), 10);
        (scheduler, clock)
    }

    #[test]
    fn availability_normalizes_to_the_hour() {
        let (scheduler, _) = scheduler_with_clock();
        let out = scheduler.check_availability("sess-a", fixed_start());
        assert_eq!(out["available"], true);
        assert_eq!(
            out["proposal"]["start_time"].as_str().unwrap(),
            "2025-09-25T02:00:00+00:00"
        );
    }

    #[test]
    fn hold_blocks_other_sessions_until_expiry() {
        let (scheduler, clock) = scheduler_with_clock();
        scheduler.check_availability("sess-a", fixed_start());

        let blocked = scheduler.check_availability("sess-b", fixed_start());
        assert_eq!(blocked["available"], false);

        clock.advance(Duration::minutes(11));
        let freed = scheduler.check_availability("sess-b", fixed_start());
        assert_eq!(freed["available"], true);
    }

    #[test]
    fn booking_promotes_own_hold() {
        let (scheduler, _) = scheduler_with_clock();
        scheduler.check_availability("sess-a", fixed_start());

        let booked = scheduler.book_reservation("sess-a", fixed_start());
        assert_eq!(booked["success"], true);
        assert_eq!(booked["reservation"]["status"], "confirmed");

        // Idempotent for the same session.
        let again = scheduler.book_reservation("sess-a", fixed_start());
        assert_eq!(again["success"], true);
        assert!(again["note"].is_string());

        let other = scheduler.book_reservation("sess-b", fixed_start());
        assert_eq!(other["success"], false);
    }

    #[test]
    fn cancel_requires_owner_and_frees_slot() {
        let (scheduler, clock) = scheduler_with_clock();
        scheduler.check_availability("sess-a", fixed_start());
        let booked = scheduler.book_reservation("sess-a", fixed_start());
        let id = booked["reservation"]["reservation_id"].as_str().unwrap();

        // Wrong session cannot cancel.
        let denied = scheduler.cancel_reservation(id, "sess-b");
        assert_eq!(denied["success"], false);

        let cancelled = scheduler.cancel_reservation(id, "sess-a");
        assert_eq!(cancelled["success"], true);

        // Slot is free again after cancel.
        clock.advance(Duration::minutes(1));
        let freed = scheduler.check_availability("sess-b", fixed_start());
        assert_eq!(freed["available"], true);
    }
}
