use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{Conflict, SlotKey, TimeRange};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    SlotNotFound(SlotKey),
    AlreadyExists(Ulid),
    ScheduleInactive(Ulid),
    InvalidTimeRange(TimeRange),
    EmptySchedule,
    InvalidCapacity(u32),
    OverlappingSlots(TimeRange, TimeRange),
    InvalidIdentity(&'static str),
    Conflicts(Vec<Conflict>),
    DuplicateSchedule {
        doctor_id: Ulid,
        date: NaiveDate,
        existing: Ulid,
    },
    SlotHasBookings(Ulid),
    CapacityBelowBooked {
        time_slot_id: Ulid,
        booked: u32,
        requested: u32,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Error class reported to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_)
            | EngineError::SlotNotFound(_)
            | EngineError::ScheduleInactive(_) => "not_found",
            EngineError::InvalidTimeRange(_)
            | EngineError::EmptySchedule
            | EngineError::InvalidCapacity(_)
            | EngineError::OverlappingSlots(..)
            | EngineError::InvalidIdentity(_)
            | EngineError::AlreadyExists(_)
            | EngineError::SlotHasBookings(_)
            | EngineError::CapacityBelowBooked { .. } => "validation",
            EngineError::Conflicts(_) | EngineError::DuplicateSchedule { .. } => "conflict",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::WalError(_) => "storage",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::SlotNotFound(key) => write!(f, "time slot not found: {key}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::ScheduleInactive(id) => write!(f, "schedule {id} is not active"),
            EngineError::InvalidTimeRange(range) => {
                write!(f, "invalid time range {}-{}: start must be before end", range.start, range.end)
            }
            EngineError::EmptySchedule => write!(f, "a schedule needs at least one time slot"),
            EngineError::InvalidCapacity(n) => write!(f, "invalid max bookings: {n}"),
            EngineError::OverlappingSlots(a, b) => {
                write!(f, "time slots {a} and {b} overlap")
            }
            EngineError::InvalidIdentity(msg) => write!(f, "invalid identity: {msg}"),
            EngineError::Conflicts(conflicts) => {
                write!(f, "{} scheduling conflict(s)", conflicts.len())?;
                if let Some(first) = conflicts.first() {
                    write!(f, ": {}", first.message)?;
                }
                Ok(())
            }
            EngineError::DuplicateSchedule {
                doctor_id,
                date,
                existing,
            } => write!(
                f,
                "doctor {doctor_id} already has active schedule {existing} on {date}"
            ),
            EngineError::SlotHasBookings(id) => {
                write!(f, "time slot {id} has bookings and cannot be removed")
            }
            EngineError::CapacityBelowBooked {
                time_slot_id,
                booked,
                requested,
            } => write!(
                f,
                "time slot {time_slot_id} has {booked} bookings; max bookings cannot drop to {requested}"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
