use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};
use ulid::Ulid;

use crate::appointments::{Appointment, AppointmentStatus, AppointmentStore, StoreError};
use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::observability::{COMPENSATIONS_TOTAL, COMPENSATION_FAILURES_TOTAL};

#[derive(Debug)]
pub enum BookingError {
    /// The slot had no capacity left. Expected under contention.
    SlotFull(SlotKey),
    Engine(EngineError),
    Store(StoreError),
    InvalidTransition {
        appointment_id: Ulid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    /// The caller is not the patient the appointment belongs to.
    NotOwner(Ulid),
    NotFound(Ulid),
}

impl BookingError {
    /// Error class reported to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::SlotFull(_) => "slot_full",
            BookingError::Engine(e) => e.kind(),
            BookingError::Store(StoreError::NotFound(_)) | BookingError::NotFound(_) => "not_found",
            BookingError::Store(StoreError::AlreadyExists(_)) => "conflict",
            BookingError::Store(StoreError::Unavailable(_)) => "storage",
            BookingError::InvalidTransition { .. } | BookingError::NotOwner(_) => "validation",
        }
    }
}

impl fmt::Display for BookingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookingError::SlotFull(key) => write!(f, "time slot {key} is full"),
            BookingError::Engine(e) => write!(f, "{e}"),
            BookingError::Store(e) => write!(f, "{e}"),
            BookingError::InvalidTransition {
                appointment_id,
                from,
                to,
            } => write!(f, "appointment {appointment_id} cannot go from {from} to {to}"),
            BookingError::NotOwner(id) => {
                write!(f, "appointment {id} belongs to another patient")
            }
            BookingError::NotFound(id) => write!(f, "appointment not found: {id}"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<EngineError> for BookingError {
    fn from(e: EngineError) -> Self {
        BookingError::Engine(e)
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => BookingError::NotFound(id),
            other => BookingError::Store(other),
        }
    }
}

/// Turns a confirmed submission into a persisted appointment.
///
/// Capacity is reserved first and is the final authority; the appointment
/// write follows outside any critical section. If that write fails the
/// reservation is released again. Nothing here is a transaction.
pub struct BookingOrchestrator {
    pub engine: Arc<Engine>,
    store: Arc<dyn AppointmentStore>,
}

impl BookingOrchestrator {
    pub fn new(engine: Arc<Engine>, store: Arc<dyn AppointmentStore>) -> Self {
        Self { engine, store }
    }

    pub async fn appointment(&self, id: Ulid) -> Result<Appointment, BookingError> {
        Ok(self.store.get(id).await?)
    }

    /// Book `key` for the caller, then release the caller's lock on it.
    /// A full slot fails fast and leaves the lock alone.
    pub async fn submit(
        &self,
        key: SlotKey,
        patient_id: &str,
        notes: Option<String>,
    ) -> Result<Appointment, BookingError> {
        let appointment = self.book(key, patient_id, notes).await?;
        // Best-effort: a lock left behind simply expires.
        self.engine.release_lock(&key, patient_id);
        info!(
            "booked appointment {} on {key} for {patient_id}",
            appointment.id
        );
        Ok(appointment)
    }

    /// Cancel one of the caller's open appointments and give its unit of
    /// capacity back.
    pub async fn cancel(&self, appointment_id: Ulid, patient_id: &str) -> Result<Appointment, BookingError> {
        let current = self.store.get(appointment_id).await?;
        ensure_owner(&current, patient_id)?;
        ensure_transition(&current, AppointmentStatus::Cancelled)?;

        let cancelled = self
            .store
            .set_status(appointment_id, AppointmentStatus::Cancelled)
            .await?;
        let key = cancelled.key();
        if let Err(e) = self.engine.release_booking(key, appointment_id).await {
            error!(
                "appointment {appointment_id} cancelled but capacity on {key} not released: {e}"
            );
            metrics::counter!(COMPENSATION_FAILURES_TOTAL).increment(1);
            return Err(e.into());
        }
        info!("cancelled appointment {appointment_id} on {key}");
        Ok(cancelled)
    }

    /// Move one of the caller's appointments to `new_key`.
    ///
    /// The new slot is reserved before anything happens to the old one, so a
    /// full target leaves the original appointment untouched. Only then is the
    /// old appointment marked rescheduled and its capacity released.
    pub async fn reschedule(
        &self,
        appointment_id: Ulid,
        new_key: SlotKey,
        patient_id: &str,
    ) -> Result<Appointment, BookingError> {
        let old = self.store.get(appointment_id).await?;
        ensure_owner(&old, patient_id)?;
        ensure_transition(&old, AppointmentStatus::Rescheduled)?;

        let new = self
            .book(new_key, &old.patient_id, old.notes.clone())
            .await?;

        if let Err(e) = self
            .store
            .set_status(old.id, AppointmentStatus::Rescheduled)
            .await
        {
            warn!("reschedule of {} failed, undoing new booking {}: {e}", old.id, new.id);
            if let Err(undo) = self.store.set_status(new.id, AppointmentStatus::Cancelled).await {
                error!("could not cancel replacement appointment {}: {undo}", new.id);
            }
            self.compensate(new_key, new.id).await;
            return Err(e.into());
        }

        let old_key = old.key();
        if let Err(e) = self.engine.release_booking(old_key, old.id).await {
            error!(
                "appointment {} rescheduled but capacity on {old_key} not released: {e}",
                old.id
            );
            metrics::counter!(COMPENSATION_FAILURES_TOTAL).increment(1);
        }
        self.engine.release_lock(&new_key, patient_id);
        info!("rescheduled appointment {} from {old_key} to {new_key} as {}", old.id, new.id);
        Ok(new)
    }

    /// Reserve a unit on `key` and persist a confirmed appointment holding it.
    async fn book(
        &self,
        key: SlotKey,
        patient_id: &str,
        notes: Option<String>,
    ) -> Result<Appointment, BookingError> {
        if patient_id.is_empty() || patient_id.len() > MAX_IDENTITY_LEN {
            return Err(EngineError::InvalidIdentity("bad patient id").into());
        }
        if notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long").into());
        }
        let ctx = self.engine.slot_context(key).await?;

        let appointment_id = Ulid::new();
        if let Reservation::SlotFull = self.engine.reserve(key, appointment_id).await? {
            return Err(BookingError::SlotFull(key));
        }

        let appointment = Appointment {
            id: appointment_id,
            schedule_id: key.schedule_id,
            time_slot_id: key.time_slot_id,
            patient_id: patient_id.to_string(),
            doctor_id: ctx.channel.doctor_id,
            room_id: ctx.room_id,
            status: AppointmentStatus::Confirmed,
            notes,
            created_at: crate::engine::now_ms(),
        };
        if let Err(e) = self.store.create(appointment.clone()).await {
            warn!("storing appointment {appointment_id} failed, releasing {key}: {e}");
            self.compensate(key, appointment_id).await;
            return Err(BookingError::Store(e));
        }
        Ok(appointment)
    }

    /// Undo a reservation whose appointment never made it to the store.
    async fn compensate(&self, key: SlotKey, appointment_id: Ulid) {
        metrics::counter!(COMPENSATIONS_TOTAL).increment(1);
        if let Err(e) = self.engine.release_booking(key, appointment_id).await {
            // Nothing left to retry with: the slot now over-counts by one.
            error!(
                schedule_id = %key.schedule_id,
                time_slot_id = %key.time_slot_id,
                appointment_id = %appointment_id,
                "compensating release failed, slot needs manual reconciliation: {e}"
            );
            metrics::counter!(COMPENSATION_FAILURES_TOTAL).increment(1);
        }
    }
}

fn ensure_owner(appointment: &Appointment, patient_id: &str) -> Result<(), BookingError> {
    if appointment.patient_id == patient_id {
        Ok(())
    } else {
        warn!("{patient_id} tried to modify appointment {} of another patient", appointment.id);
        Err(BookingError::NotOwner(appointment.id))
    }
}

fn ensure_transition(appointment: &Appointment, to: AppointmentStatus) -> Result<(), BookingError> {
    if appointment.status.can_become(to) {
        Ok(())
    } else {
        Err(BookingError::InvalidTransition {
            appointment_id: appointment.id,
            from: appointment.status,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use super::*;
    use crate::appointments::InMemoryAppointments;
    use crate::engine::EngineSettings;
    use crate::notify::NotifyHub;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_booking");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(name: &str) -> Arc<Engine> {
        Arc::new(
            Engine::new(
                test_wal_path(name),
                Arc::new(NotifyHub::new()),
                EngineSettings::default(),
            )
            .unwrap(),
        )
    }

    async fn slot(engine: &Engine, start_hour: u32, max_bookings: u32) -> SlotKey {
        let mut draft = SlotDraft::new(
            TimeRange::hm((start_hour, 0), (start_hour, 30)).unwrap(),
            Ulid::new(),
        );
        draft.max_bookings = max_bookings;
        let schedule = engine
            .create_schedule(CandidateSchedule {
                doctor_id: Ulid::new(),
                hospital_id: Ulid::new(),
                date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                slots: vec![draft],
            })
            .await
            .unwrap();
        SlotKey::new(schedule.id, schedule.time_slots[0].id)
    }

    /// Delegates to memory but can be told to fail writes.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryAppointments,
        fail_create: AtomicBool,
        fail_status: AtomicBool,
    }

    #[async_trait]
    impl AppointmentStore for FlakyStore {
        async fn create(&self, appointment: Appointment) -> Result<Ulid, StoreError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk on fire".into()));
            }
            self.inner.create(appointment).await
        }

        async fn get(&self, id: Ulid) -> Result<Appointment, StoreError> {
            self.inner.get(id).await
        }

        async fn set_status(&self, id: Ulid, status: AppointmentStatus) -> Result<Appointment, StoreError> {
            if self.fail_status.load(Ordering::SeqCst) && status == AppointmentStatus::Rescheduled {
                return Err(StoreError::Unavailable("disk on fire".into()));
            }
            self.inner.set_status(id, status).await
        }
    }

    #[tokio::test]
    async fn submit_happy_path() {
        let engine = engine("submit_happy.wal");
        let key = slot(&engine, 9, 3).await;
        let booking = BookingOrchestrator::new(engine.clone(), Arc::new(InMemoryAppointments::new()));

        engine.acquire_lock(key, "patient-a").await.unwrap();
        let appt = booking
            .submit(key, "patient-a", Some("first visit".into()))
            .await
            .unwrap();

        assert_eq!(appt.status, AppointmentStatus::Confirmed);
        assert_eq!(appt.key(), key);
        let status = engine.slot_status(key).await.unwrap();
        assert_eq!(status.booked_count, 1);
        assert!(!status.is_full);
        assert_eq!(engine.lock_holder(&key), None);
        assert_eq!(booking.appointment(appt.id).await.unwrap(), appt);
    }

    #[tokio::test]
    async fn submit_to_full_slot_fails_fast() {
        let engine = engine("submit_full.wal");
        let key = slot(&engine, 9, 1).await;
        let booking = BookingOrchestrator::new(engine.clone(), Arc::new(InMemoryAppointments::new()));

        booking.submit(key, "patient-a", None).await.unwrap();
        let result = booking.submit(key, "patient-b", None).await;
        assert!(matches!(result, Err(BookingError::SlotFull(k)) if k == key));
        assert_eq!(engine.slot_status(key).await.unwrap().booked_count, 1);
    }

    #[tokio::test]
    async fn failed_store_write_releases_capacity() {
        let engine = engine("submit_compensate.wal");
        let key = slot(&engine, 9, 3).await;
        let store = Arc::new(FlakyStore::default());
        store.fail_create.store(true, Ordering::SeqCst);
        let booking = BookingOrchestrator::new(engine.clone(), store.clone());

        let result = booking.submit(key, "patient-a", None).await;
        assert!(matches!(result, Err(BookingError::Store(StoreError::Unavailable(_)))));
        assert_eq!(engine.slot_status(key).await.unwrap().booked_count, 0);
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn cancel_releases_capacity_once() {
        let engine = engine("cancel.wal");
        let key = slot(&engine, 9, 3).await;
        let booking = BookingOrchestrator::new(engine.clone(), Arc::new(InMemoryAppointments::new()));

        let appt = booking.submit(key, "patient-a", None).await.unwrap();
        let cancelled = booking.cancel(appt.id, "patient-a").await.unwrap();
        assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
        assert_eq!(engine.slot_status(key).await.unwrap().booked_count, 0);

        let again = booking.cancel(appt.id, "patient-a").await;
        assert!(matches!(again, Err(BookingError::InvalidTransition { .. })));
        assert!(matches!(
            booking.cancel(Ulid::new(), "patient-a").await,
            Err(BookingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reschedule_moves_capacity() {
        let engine = engine("reschedule.wal");
        let from = slot(&engine, 9, 3).await;
        let to = slot(&engine, 10, 3).await;
        let booking = BookingOrchestrator::new(engine.clone(), Arc::new(InMemoryAppointments::new()));

        let old = booking.submit(from, "patient-a", None).await.unwrap();
        let new = booking.reschedule(old.id, to, "patient-a").await.unwrap();

        assert_eq!(new.key(), to);
        assert_eq!(new.patient_id, "patient-a");
        assert_eq!(engine.slot_status(from).await.unwrap().booked_count, 0);
        assert_eq!(engine.slot_status(to).await.unwrap().booked_count, 1);
        assert_eq!(
            booking.appointment(old.id).await.unwrap().status,
            AppointmentStatus::Rescheduled
        );
    }

    #[tokio::test]
    async fn reschedule_to_full_slot_keeps_original() {
        let engine = engine("reschedule_full.wal");
        let from = slot(&engine, 9, 3).await;
        let to = slot(&engine, 10, 1).await;
        let booking = BookingOrchestrator::new(engine.clone(), Arc::new(InMemoryAppointments::new()));

        booking.submit(to, "patient-b", None).await.unwrap();
        let old = booking.submit(from, "patient-a", None).await.unwrap();

        let result = booking.reschedule(old.id, to, "patient-a").await;
        assert!(matches!(result, Err(BookingError::SlotFull(_))));
        assert_eq!(engine.slot_status(from).await.unwrap().booked_count, 1);
        assert_eq!(
            booking.appointment(old.id).await.unwrap().status,
            AppointmentStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn reschedule_undoes_new_booking_when_old_cannot_be_marked() {
        let engine = engine("reschedule_undo.wal");
        let from = slot(&engine, 9, 3).await;
        let to = slot(&engine, 10, 3).await;
        let store = Arc::new(FlakyStore::default());
        let booking = BookingOrchestrator::new(engine.clone(), store.clone());

        let old = booking.submit(from, "patient-a", None).await.unwrap();
        store.fail_status.store(true, Ordering::SeqCst);

        let result = booking.reschedule(old.id, to, "patient-a").await;
        assert!(matches!(result, Err(BookingError::Store(_))));
        assert_eq!(engine.slot_status(from).await.unwrap().booked_count, 1);
        assert_eq!(engine.slot_status(to).await.unwrap().booked_count, 0);
    }

    #[tokio::test]
    async fn only_the_patient_may_cancel_or_reschedule() {
        let engine = engine("not_owner.wal");
        let from = slot(&engine, 9, 1).await;
        let to = slot(&engine, 10, 3).await;
        let booking = BookingOrchestrator::new(engine.clone(), Arc::new(InMemoryAppointments::new()));

        let appt = booking.submit(from, "patient-a", None).await.unwrap();

        let cancel = booking.cancel(appt.id, "patient-b").await;
        assert!(matches!(cancel, Err(BookingError::NotOwner(id)) if id == appt.id));
        let moved = booking.reschedule(appt.id, to, "patient-b").await;
        assert!(matches!(moved, Err(BookingError::NotOwner(_))));

        assert_eq!(engine.slot_status(from).await.unwrap().booked_count, 1);
        assert_eq!(engine.slot_status(to).await.unwrap().booked_count, 0);
        assert_eq!(
            booking.appointment(appt.id).await.unwrap().status,
            AppointmentStatus::Confirmed
        );
        assert!(matches!(
            booking.submit(from, "patient-b", None).await,
            Err(BookingError::SlotFull(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submits_never_overbook() {
        let engine = engine("submit_concurrent.wal");
        let key = slot(&engine, 9, 3).await;
        let booking = Arc::new(BookingOrchestrator::new(
            engine.clone(),
            Arc::new(InMemoryAppointments::new()),
        ));

        let mut handles = Vec::new();
        for i in 0..20 {
            let booking = booking.clone();
            handles.push(tokio::spawn(async move {
                booking.submit(key, &format!("patient-{i}"), None).await
            }));
        }
        let mut confirmed = 0;
        let mut full = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => confirmed += 1,
                Err(BookingError::SlotFull(_)) => full += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(confirmed, 3);
        assert_eq!(full, 17);
        assert!(engine.slot_status(key).await.unwrap().is_full);
    }

    #[tokio::test]
    async fn oversized_notes_are_rejected_before_reserving() {
        let engine = engine("submit_notes.wal");
        let key = slot(&engine, 9, 3).await;
        let booking = BookingOrchestrator::new(engine.clone(), Arc::new(InMemoryAppointments::new()));

        let notes = "x".repeat(MAX_NOTES_LEN + 1);
        let result = booking.submit(key, "patient-a", Some(notes)).await;
        assert!(matches!(result, Err(BookingError::Engine(EngineError::LimitExceeded(_)))));
        assert_eq!(engine.slot_status(key).await.unwrap().booked_count, 0);
    }
}
