use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use ulid::Ulid;

/// Unix milliseconds. Lock timestamps only; schedules use wall-clock types.
pub type Ms = i64;

/// Capacity of a slot when the admin form leaves it blank.
pub const DEFAULT_MAX_BOOKINGS: u32 = 3;

fn default_max_bookings() -> u32 {
    DEFAULT_MAX_BOOKINGS
}

/// Half-open wall-clock range `[start, end)` within one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    /// Build from hour/minute pairs. Returns `None` for an impossible time of day.
    pub fn hm(start: (u32, u32), end: (u32, u32)) -> Option<Self> {
        let start = NaiveTime::from_hms_opt(start.0, start.1, 0)?;
        let end = NaiveTime::from_hms_opt(end.0, end.1, 0)?;
        Some(Self { start, end })
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Back-to-back ranges (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Broadcast scope: one doctor on one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub doctor_id: Ulid,
    pub date: NaiveDate,
}

impl ChannelKey {
    pub fn new(doctor_id: Ulid, date: NaiveDate) -> Self {
        Self { doctor_id, date }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doctor_{}_{}", self.doctor_id, self.date)
    }
}

/// Identifies one bookable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub schedule_id: Ulid,
    pub time_slot_id: Ulid,
}

impl SlotKey {
    pub fn new(schedule_id: Ulid, time_slot_id: Ulid) -> Self {
        Self {
            schedule_id,
            time_slot_id,
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.schedule_id, self.time_slot_id)
    }
}

// ── Schedules ────────────────────────────────────────────────

/// A bookable range within a schedule, bound to one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    pub range: TimeRange,
    pub room_id: Ulid,
    pub max_bookings: u32,
    /// Appointment ids holding a unit of this slot's capacity, in booking order.
    pub appointments: Vec<Ulid>,
}

impl TimeSlot {
    pub fn booked_count(&self) -> u32 {
        self.appointments.len() as u32
    }

    pub fn is_full(&self) -> bool {
        self.booked_count() >= self.max_bookings
    }
}

/// A doctor's slots for one date at one hospital. Plain snapshot form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub hospital_id: Ulid,
    pub date: NaiveDate,
    pub is_active: bool,
    pub time_slots: Vec<TimeSlot>,
}

impl Schedule {
    pub fn channel(&self) -> ChannelKey {
        ChannelKey::new(self.doctor_id, self.date)
    }

    pub fn slot(&self, id: Ulid) -> Option<&TimeSlot> {
        self.time_slots.iter().find(|s| s.id == id)
    }
}

/// One slot of a candidate schedule as submitted by the admin form.
/// `id` is set when an edit keeps an existing slot (and its bookings).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDraft {
    #[serde(default)]
    pub id: Option<Ulid>,
    pub range: TimeRange,
    pub room_id: Ulid,
    #[serde(default = "default_max_bookings")]
    pub max_bookings: u32,
}

impl SlotDraft {
    pub fn new(range: TimeRange, room_id: Ulid) -> Self {
        Self {
            id: None,
            range,
            room_id,
            max_bookings: DEFAULT_MAX_BOOKINGS,
        }
    }
}

/// Input to the conflict validator and to schedule creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSchedule {
    pub doctor_id: Ulid,
    pub hospital_id: Ulid,
    pub date: NaiveDate,
    pub slots: Vec<SlotDraft>,
}

impl CandidateSchedule {
    /// The admin form's common shape: several ranges in one room.
    pub fn single_room(
        doctor_id: Ulid,
        hospital_id: Ulid,
        date: NaiveDate,
        room_id: Ulid,
        ranges: &[TimeRange],
    ) -> Self {
        Self {
            doctor_id,
            hospital_id,
            date,
            slots: ranges.iter().map(|r| SlotDraft::new(*r, room_id)).collect(),
        }
    }

    pub fn channel(&self) -> ChannelKey {
        ChannelKey::new(self.doctor_id, self.date)
    }
}

/// Live, shared form of a schedule. Slot definitions change only under the
/// schedule's write lock; booking lists have their own per-slot mutex so
/// reservations on different slots never wait on each other.
#[derive(Debug)]
pub struct ScheduleState {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub hospital_id: Ulid,
    pub date: NaiveDate,
    pub is_active: bool,
    pub slots: Vec<SlotState>,
}

#[derive(Debug)]
pub struct SlotState {
    pub id: Ulid,
    pub range: TimeRange,
    pub room_id: Ulid,
    pub max_bookings: u32,
    pub bookings: Arc<Mutex<Vec<Ulid>>>,
}

impl SlotState {
    pub fn from_slot(slot: TimeSlot) -> Self {
        Self {
            id: slot.id,
            range: slot.range,
            room_id: slot.room_id,
            max_bookings: slot.max_bookings,
            bookings: Arc::new(Mutex::new(slot.appointments)),
        }
    }

    pub async fn snapshot(&self) -> TimeSlot {
        let appointments = self.bookings.lock().await.clone();
        TimeSlot {
            id: self.id,
            range: self.range,
            room_id: self.room_id,
            max_bookings: self.max_bookings,
            appointments,
        }
    }

    /// Status computed from an already-locked booking list.
    pub fn status_with(&self, schedule_id: Ulid, bookings: &[Ulid]) -> SlotStatus {
        SlotStatus::new(
            SlotKey::new(schedule_id, self.id),
            bookings.len() as u32,
            self.max_bookings,
        )
    }
}

impl From<Schedule> for ScheduleState {
    fn from(s: Schedule) -> Self {
        Self {
            id: s.id,
            doctor_id: s.doctor_id,
            hospital_id: s.hospital_id,
            date: s.date,
            is_active: s.is_active,
            slots: s.time_slots.into_iter().map(SlotState::from_slot).collect(),
        }
    }
}

impl ScheduleState {
    pub fn channel(&self) -> ChannelKey {
        ChannelKey::new(self.doctor_id, self.date)
    }

    pub fn slot(&self, id: Ulid) -> Option<&SlotState> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_keys(&self) -> impl Iterator<Item = SlotKey> + '_ {
        self.slots.iter().map(|s| SlotKey::new(self.id, s.id))
    }

    pub fn footprints(&self) -> impl Iterator<Item = SlotFootprint> + '_ {
        self.slots.iter().map(|s| SlotFootprint {
            schedule_id: self.id,
            doctor_id: self.doctor_id,
            time_slot_id: s.id,
            range: s.range,
            room_id: s.room_id,
        })
    }

    pub async fn snapshot(&self) -> Schedule {
        let mut time_slots = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            time_slots.push(slot.snapshot().await);
        }
        Schedule {
            id: self.id,
            doctor_id: self.doctor_id,
            hospital_id: self.hospital_id,
            date: self.date,
            is_active: self.is_active,
            time_slots,
        }
    }
}

/// What the conflict validator needs to know about an existing slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotFootprint {
    pub schedule_id: Ulid,
    pub doctor_id: Ulid,
    pub time_slot_id: Ulid,
    pub range: TimeRange,
    pub room_id: Ulid,
}

// ── Conflicts ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    RoomConflict,
    DoctorConflict,
}

/// One entry of a conflict report. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub conflicting_schedule_id: Ulid,
    pub conflicting_time_slot_id: Ulid,
    pub conflicting_time_slot: TimeRange,
    /// The candidate range that collided.
    pub candidate: TimeRange,
    pub message: String,
}

// ── Locks & capacity ─────────────────────────────────────────

/// Ephemeral exclusive claim on a slot during interactive booking. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLock {
    pub schedule_id: Ulid,
    pub time_slot_id: Ulid,
    pub holder_id: String,
    pub acquired_at: Ms,
    pub expires_at: Ms,
    pub channel: ChannelKey,
}

impl SlotLock {
    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.schedule_id, self.time_slot_id)
    }

    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Another holder has a live lock on the slot.
    HeldByOther,
    /// The slot has no remaining capacity.
    SlotFull,
    /// The holder already holds the maximum number of locks.
    TooManyLocks,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::HeldByOther => write!(f, "held_by_other"),
            RejectReason::SlotFull => write!(f, "slot_full"),
            RejectReason::TooManyLocks => write!(f, "too_many_locks"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired(SlotLock),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub schedule_id: Ulid,
    pub time_slot_id: Ulid,
    pub booked_count: u32,
    pub max_bookings: u32,
    pub is_full: bool,
}

impl SlotStatus {
    pub fn new(key: SlotKey, booked_count: u32, max_bookings: u32) -> Self {
        Self {
            schedule_id: key.schedule_id,
            time_slot_id: key.time_slot_id,
            booked_count,
            max_bookings,
            is_full: booked_count >= max_bookings,
        }
    }
}

/// Result of a capacity reservation. A full slot is an expected outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved(SlotStatus),
    SlotFull,
}

// ── Channel notifications ────────────────────────────────────

/// Published to every subscriber of a doctor+date channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Locked {
        schedule_id: Ulid,
        time_slot_id: Ulid,
        holder_id: String,
        expires_at: Ms,
    },
    Unlocked {
        schedule_id: Ulid,
        time_slot_id: Ulid,
    },
    StatusChanged {
        schedule_id: Ulid,
        time_slot_id: Ulid,
        booked_count: u32,
        max_bookings: u32,
        is_full: bool,
    },
    ScheduleChanged {
        schedule_id: Ulid,
        is_active: bool,
    },
}

impl Notification {
    pub fn locked(lock: &SlotLock) -> Self {
        Notification::Locked {
            schedule_id: lock.schedule_id,
            time_slot_id: lock.time_slot_id,
            holder_id: lock.holder_id.clone(),
            expires_at: lock.expires_at,
        }
    }

    pub fn unlocked(key: SlotKey) -> Self {
        Notification::Unlocked {
            schedule_id: key.schedule_id,
            time_slot_id: key.time_slot_id,
        }
    }

    pub fn status_changed(status: &SlotStatus) -> Self {
        Notification::StatusChanged {
            schedule_id: status.schedule_id,
            time_slot_id: status.time_slot_id,
            booked_count: status.booked_count,
            max_bookings: status.max_bookings,
            is_full: status.is_full,
        }
    }
}

// ── WAL records ──────────────────────────────────────────────

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ScheduleCreated {
        schedule: Schedule,
    },
    SlotsReplaced {
        schedule_id: Ulid,
        hospital_id: Ulid,
        time_slots: Vec<TimeSlot>,
    },
    ActivationChanged {
        schedule_id: Ulid,
        is_active: bool,
    },
    SlotReserved {
        schedule_id: Ulid,
        time_slot_id: Ulid,
        appointment_id: Ulid,
    },
    SlotReleased {
        schedule_id: Ulid,
        time_slot_id: Ulid,
        appointment_id: Ulid,
    },
}
