use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{COMPENSATION_FAILURES_TOTAL, RESERVATIONS_TOTAL};

use super::{Engine, EngineError};

impl Engine {
    /// Take one unit of a slot's capacity for `appointment_id`.
    ///
    /// The count check and the append happen under the slot's booking mutex,
    /// so two reserves on the same key never see the same count. Slot locks
    /// are not consulted. When the append fills the slot, any lock on it is
    /// destroyed.
    pub async fn reserve(&self, key: SlotKey, appointment_id: Ulid) -> Result<Reservation, EngineError> {
        let rs = self.require_schedule(key.schedule_id)?;
        let guard = rs.read().await;
        if !guard.is_active {
            return Err(EngineError::ScheduleInactive(key.schedule_id));
        }
        let slot = guard
            .slot(key.time_slot_id)
            .ok_or(EngineError::SlotNotFound(key))?;
        let channel = guard.channel();

        let mut bookings = slot.bookings.lock().await;
        if bookings.contains(&appointment_id) {
            return Err(EngineError::AlreadyExists(appointment_id));
        }
        if bookings.len() as u32 >= slot.max_bookings {
            metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "slot_full").increment(1);
            debug!("reserve on {key} rejected: slot full");
            return Ok(Reservation::SlotFull);
        }

        // Logged before applied: a writer that is gone leaves the slot untouched.
        let pending = self.enqueue(Event::SlotReserved {
            schedule_id: key.schedule_id,
            time_slot_id: key.time_slot_id,
            appointment_id,
        })?;
        bookings.push(appointment_id);
        let status = slot.status_with(key.schedule_id, &bookings);
        if status.is_full {
            self.drop_lock(&key);
        }
        self.notify.send(&channel, Notification::status_changed(&status));
        drop(bookings);
        drop(guard);

        if let Err(e) = pending.durable().await {
            error!("reservation {appointment_id} on {key} not durable, rolling back: {e}");
            self.undo_reserve(key, appointment_id).await;
            metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "storage_error").increment(1);
            return Err(e);
        }

        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "reserved").increment(1);
        debug!(
            "reserved {key} for {appointment_id}: {}/{}",
            status.booked_count, status.max_bookings
        );
        Ok(Reservation::Reserved(status))
    }

    /// Give back the unit of capacity held by `appointment_id` and return the
    /// slot's new status. Releasing an id that is not booked on the slot
    /// changes nothing and only logs a warning.
    pub async fn release_booking(&self, key: SlotKey, appointment_id: Ulid) -> Result<SlotStatus, EngineError> {
        let rs = self.require_schedule(key.schedule_id)?;
        let guard = rs.read().await;
        let slot = guard
            .slot(key.time_slot_id)
            .ok_or(EngineError::SlotNotFound(key))?;
        let channel = guard.channel();

        let mut bookings = slot.bookings.lock().await;
        let Some(pos) = bookings.iter().position(|a| *a == appointment_id) else {
            warn!("release of {appointment_id} on {key} ignored: not booked there");
            return Ok(slot.status_with(key.schedule_id, &bookings));
        };

        let pending = self.enqueue(Event::SlotReleased {
            schedule_id: key.schedule_id,
            time_slot_id: key.time_slot_id,
            appointment_id,
        })?;
        bookings.remove(pos);
        let status = slot.status_with(key.schedule_id, &bookings);
        self.notify.send(&channel, Notification::status_changed(&status));
        drop(bookings);
        drop(guard);

        pending.durable().await?;
        debug!(
            "released {appointment_id} from {key}: {}/{}",
            status.booked_count, status.max_bookings
        );
        Ok(status)
    }

    /// Remove a reservation whose log write failed. The logged record, if it
    /// ever reaches disk, is cancelled out by a release record.
    async fn undo_reserve(&self, key: SlotKey, appointment_id: Ulid) {
        let Some(rs) = self.get_schedule_state(&key.schedule_id) else {
            return;
        };
        let guard = rs.read().await;
        let Some(slot) = guard.slot(key.time_slot_id) else {
            return;
        };
        let mut bookings = slot.bookings.lock().await;
        let Some(pos) = bookings.iter().position(|a| *a == appointment_id) else {
            return;
        };
        bookings.remove(pos);
        if let Err(e) = self.enqueue(Event::SlotReleased {
            schedule_id: key.schedule_id,
            time_slot_id: key.time_slot_id,
            appointment_id,
        }) {
            // Memory is right; a replay may still bring the booking back.
            error!(
                schedule_id = %key.schedule_id,
                time_slot_id = %key.time_slot_id,
                appointment_id = %appointment_id,
                "rollback of reservation could not be logged, needs manual reconciliation: {e}"
            );
            metrics::counter!(COMPENSATION_FAILURES_TOTAL).increment(1);
        }
        let status = slot.status_with(key.schedule_id, &bookings);
        self.notify
            .send(&guard.channel(), Notification::status_changed(&status));
    }
}
