use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_slots;
use super::{Engine, EngineError};

impl Engine {
    /// Create a schedule after validating its slots, checking it against every
    /// active schedule for the same doctor or room on that date, and making
    /// sure the doctor has no other active schedule that day.
    pub async fn create_schedule(&self, candidate: CandidateSchedule) -> Result<Schedule, EngineError> {
        let _admin = self.admin.lock().await;
        if self.schedules.len() >= MAX_SCHEDULES {
            return Err(EngineError::LimitExceeded("too many schedules"));
        }

        let conflicts = self.validate_schedule(&candidate, None).await?;
        reject_conflicts(conflicts)?;
        self.ensure_single_active(candidate.channel(), None)?;

        let schedule = Schedule {
            id: Ulid::new(),
            doctor_id: candidate.doctor_id,
            hospital_id: candidate.hospital_id,
            date: candidate.date,
            is_active: true,
            time_slots: candidate
                .slots
                .into_iter()
                .map(|d| TimeSlot {
                    id: Ulid::new(),
                    range: d.range,
                    room_id: d.room_id,
                    max_bookings: d.max_bookings,
                    appointments: Vec::new(),
                })
                .collect(),
        };

        // Nobody can see the schedule until it is indexed, so wait here.
        self.enqueue(Event::ScheduleCreated {
            schedule: schedule.clone(),
        })?
        .durable()
        .await?;
        self.index_schedule(schedule.clone());

        self.notify.send(
            &schedule.channel(),
            Notification::ScheduleChanged {
                schedule_id: schedule.id,
                is_active: true,
            },
        );
        info!(
            "created schedule {} for doctor {} on {} ({} slots)",
            schedule.id,
            schedule.doctor_id,
            schedule.date,
            schedule.time_slots.len()
        );
        Ok(schedule)
    }

    /// Replace a schedule's slot list.
    ///
    /// Drafts carrying an `id` keep that slot and its bookings. Dropping a slot
    /// that still has bookings, or lowering a slot's capacity below its booked
    /// count, is rejected. Locks on removed slots are released.
    pub async fn update_schedule(
        &self,
        schedule_id: Ulid,
        hospital_id: Option<Ulid>,
        slots: Vec<SlotDraft>,
    ) -> Result<Schedule, EngineError> {
        let _admin = self.admin.lock().await;
        let rs = self.require_schedule(schedule_id)?;

        let (candidate, is_active) = {
            let guard = rs.read().await;
            (
                CandidateSchedule {
                    doctor_id: guard.doctor_id,
                    hospital_id: hospital_id.unwrap_or(guard.hospital_id),
                    date: guard.date,
                    slots,
                },
                guard.is_active,
            )
        };
        validate_slots(&candidate.slots)?;
        // Inactive schedules block nothing; they are re-checked on activation.
        if is_active {
            let conflicts = self.validate_schedule(&candidate, Some(schedule_id)).await?;
            reject_conflicts(conflicts)?;
        }

        let mut guard = rs.write().await;

        // Check every guard before touching anything.
        let mut kept = HashSet::new();
        for draft in &candidate.slots {
            let Some(slot_id) = draft.id else { continue };
            if !kept.insert(slot_id) {
                return Err(EngineError::AlreadyExists(slot_id));
            }
            let current = guard
                .slot(slot_id)
                .ok_or(EngineError::SlotNotFound(SlotKey::new(schedule_id, slot_id)))?;
            let booked = current.bookings.lock().await.len() as u32;
            if draft.max_bookings < booked {
                return Err(EngineError::CapacityBelowBooked {
                    time_slot_id: slot_id,
                    booked,
                    requested: draft.max_bookings,
                });
            }
        }
        for slot in &guard.slots {
            if !kept.contains(&slot.id) && !slot.bookings.lock().await.is_empty() {
                return Err(EngineError::SlotHasBookings(slot.id));
            }
        }

        let mut next = Vec::with_capacity(candidate.slots.len());
        for draft in &candidate.slots {
            let (id, bookings) = match draft.id.and_then(|id| guard.slot(id)) {
                Some(current) => (current.id, current.bookings.clone()),
                None => (Ulid::new(), Arc::new(Mutex::new(Vec::new()))),
            };
            next.push(SlotState {
                id,
                range: draft.range,
                room_id: draft.room_id,
                max_bookings: draft.max_bookings,
                bookings,
            });
        }
        let mut time_slots = Vec::with_capacity(next.len());
        for slot in &next {
            time_slots.push(slot.snapshot().await);
        }

        let removed: Vec<SlotKey> = guard
            .slots
            .iter()
            .filter(|s| !kept.contains(&s.id))
            .map(|s| SlotKey::new(schedule_id, s.id))
            .collect();
        let now_full: Vec<SlotKey> = time_slots
            .iter()
            .filter(|s| s.is_full())
            .map(|s| SlotKey::new(schedule_id, s.id))
            .collect();

        let pending = self.enqueue(Event::SlotsReplaced {
            schedule_id,
            hospital_id: candidate.hospital_id,
            time_slots: time_slots.clone(),
        })?;
        guard.hospital_id = candidate.hospital_id;
        guard.slots = next;

        for key in removed.iter().chain(now_full.iter()) {
            self.drop_lock(key);
        }
        let channel = guard.channel();
        self.notify.send(
            &channel,
            Notification::ScheduleChanged {
                schedule_id,
                is_active: guard.is_active,
            },
        );
        let schedule = Schedule {
            id: guard.id,
            doctor_id: guard.doctor_id,
            hospital_id: guard.hospital_id,
            date: guard.date,
            is_active: guard.is_active,
            time_slots,
        };
        drop(guard);

        pending.durable().await?;
        info!(
            "updated schedule {schedule_id}: {} slots ({} removed)",
            schedule.time_slots.len(),
            removed.len()
        );
        Ok(schedule)
    }

    /// Activate or deactivate a schedule. Activation re-runs conflict and
    /// single-active checks; deactivation force-releases every lock on it.
    /// Setting the current state again is a no-op.
    pub async fn set_schedule_active(
        &self,
        schedule_id: Ulid,
        active: bool,
    ) -> Result<Schedule, EngineError> {
        let _admin = self.admin.lock().await;
        let rs = self.require_schedule(schedule_id)?;

        let candidate = {
            let guard = rs.read().await;
            if guard.is_active == active {
                return Ok(guard.snapshot().await);
            }
            CandidateSchedule {
                doctor_id: guard.doctor_id,
                hospital_id: guard.hospital_id,
                date: guard.date,
                slots: guard
                    .slots
                    .iter()
                    .map(|s| SlotDraft {
                        id: Some(s.id),
                        range: s.range,
                        room_id: s.room_id,
                        max_bookings: s.max_bookings,
                    })
                    .collect(),
            }
        };
        let channel = candidate.channel();
        if active {
            let conflicts = self.validate_schedule(&candidate, Some(schedule_id)).await?;
            reject_conflicts(conflicts)?;
            self.ensure_single_active(channel, Some(schedule_id))?;
        }

        let mut guard = rs.write().await;
        let pending = self.enqueue(Event::ActivationChanged {
            schedule_id,
            is_active: active,
        })?;
        guard.is_active = active;
        if active {
            self.active.insert(channel, schedule_id);
        } else {
            self.active.remove_if(&channel, |_, id| *id == schedule_id);
            let keys: Vec<SlotKey> = guard.slot_keys().collect();
            for key in &keys {
                self.drop_lock(key);
            }
        }
        self.notify.send(
            &channel,
            Notification::ScheduleChanged {
                schedule_id,
                is_active: active,
            },
        );
        let schedule = guard.snapshot().await;
        drop(guard);

        pending.durable().await?;
        info!(
            "schedule {schedule_id} {}",
            if active { "activated" } else { "deactivated" }
        );
        Ok(schedule)
    }

    fn ensure_single_active(&self, channel: ChannelKey, exclude: Option<Ulid>) -> Result<(), EngineError> {
        match self.active.get(&channel) {
            Some(existing) if Some(*existing.value()) != exclude => Err(EngineError::DuplicateSchedule {
                doctor_id: channel.doctor_id,
                date: channel.date,
                existing: *existing.value(),
            }),
            _ => Ok(()),
        }
    }
}

fn reject_conflicts(conflicts: Vec<Conflict>) -> Result<(), EngineError> {
    if conflicts.is_empty() {
        return Ok(());
    }
    for c in &conflicts {
        let kind = match c.kind {
            ConflictKind::DoctorConflict => "doctor_conflict",
            ConflictKind::RoomConflict => "room_conflict",
        };
        metrics::counter!(crate::observability::SCHEDULE_CONFLICTS_TOTAL, "kind" => kind).increment(1);
    }
    warn!("schedule write rejected: {} conflict(s)", conflicts.len());
    Err(EngineError::Conflicts(conflicts))
}
