use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Ms, SlotKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    Rescheduled,
}

impl AppointmentStatus {
    /// `pending → confirmed → completed`; anything not yet finished may be
    /// cancelled or rescheduled.
    pub fn can_become(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Confirmed, Completed)
                | (Pending | Confirmed, Cancelled)
                | (Pending | Confirmed, Rescheduled)
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Rescheduled => "rescheduled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub schedule_id: Ulid,
    pub time_slot_id: Ulid,
    pub patient_id: String,
    pub doctor_id: Ulid,
    pub room_id: Ulid,
    pub status: AppointmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: Ms,
}

impl Appointment {
    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.schedule_id, self.time_slot_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "appointment not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "appointment already exists: {id}"),
            StoreError::Unavailable(msg) => write!(f, "appointment store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistence for appointments. Not transactional with slot capacity:
/// callers compensate by hand when a write fails after a reservation.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn create(&self, appointment: Appointment) -> Result<Ulid, StoreError>;

    async fn get(&self, id: Ulid) -> Result<Appointment, StoreError>;

    /// Move an appointment to `status` and return the updated record.
    async fn set_status(&self, id: Ulid, status: AppointmentStatus) -> Result<Appointment, StoreError>;
}

/// Process-local store. Good enough for a single-node deployment where the
/// schedule WAL is the durable record of who holds which slot.
#[derive(Default)]
pub struct InMemoryAppointments {
    records: DashMap<Ulid, Appointment>,
}

impl InMemoryAppointments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl AppointmentStore for InMemoryAppointments {
    async fn create(&self, appointment: Appointment) -> Result<Ulid, StoreError> {
        match self.records.entry(appointment.id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(appointment.id)),
            Entry::Vacant(slot) => {
                let id = appointment.id;
                slot.insert(appointment);
                Ok(id)
            }
        }
    }

    async fn get(&self, id: Ulid) -> Result<Appointment, StoreError> {
        self.records
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn set_status(&self, id: Ulid, status: AppointmentStatus) -> Result<Appointment, StoreError> {
        let mut record = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.status = status;
        Ok(record.clone())
    }
}
