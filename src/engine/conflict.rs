use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Reject malformed slot lists before any conflict lookup.
///
/// Ranges within one candidate may not overlap at all: every slot in a
/// schedule belongs to the same doctor, whatever room it is in.
pub fn validate_slots(slots: &[SlotDraft]) -> Result<(), EngineError> {
    if slots.is_empty() {
        return Err(EngineError::EmptySchedule);
    }
    if slots.len() > MAX_SLOTS_PER_SCHEDULE {
        return Err(EngineError::LimitExceeded("too many time slots in schedule"));
    }
    for slot in slots {
        if !slot.range.is_valid() {
            return Err(EngineError::InvalidTimeRange(slot.range));
        }
        if slot.max_bookings == 0 || slot.max_bookings > MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::InvalidCapacity(slot.max_bookings));
        }
    }

    let mut sorted: Vec<TimeRange> = slots.iter().map(|s| s.range).collect();
    sorted.sort_by_key(|r| r.start);
    for pair in sorted.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(EngineError::OverlappingSlots(pair[0], pair[1]));
        }
    }
    Ok(())
}

/// Compare every candidate slot with every existing slot.
///
/// An overlapping pair is a `doctor_conflict` when the doctors match (a
/// doctor cannot be in two rooms at once, so this wins even if the room also
/// matches) and a `room_conflict` when only the room matches. Slots of
/// `exclude` are skipped so an edit never collides with itself.
pub fn detect_conflicts(
    candidate: &CandidateSchedule,
    existing: &[SlotFootprint],
    exclude: Option<Ulid>,
) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for other in existing {
        if Some(other.schedule_id) == exclude {
            continue;
        }
        for slot in &candidate.slots {
            if !slot.range.overlaps(&other.range) {
                continue;
            }
            let (kind, message) = if other.doctor_id == candidate.doctor_id {
                (
                    ConflictKind::DoctorConflict,
                    format!(
                        "doctor is already scheduled {} in schedule {}",
                        other.range, other.schedule_id
                    ),
                )
            } else if other.room_id == slot.room_id {
                (
                    ConflictKind::RoomConflict,
                    format!(
                        "room {} is already in use {} by schedule {}",
                        other.room_id, other.range, other.schedule_id
                    ),
                )
            } else {
                continue;
            };
            conflicts.push(Conflict {
                kind,
                conflicting_schedule_id: other.schedule_id,
                conflicting_time_slot_id: other.time_slot_id,
                conflicting_time_slot: other.range,
                candidate: slot.range,
                message,
            });
        }
    }
    conflicts
}

impl Engine {
    /// Slots of every active schedule on the candidate's date that belongs to
    /// the same doctor or uses one of the candidate's rooms.
    pub(super) async fn footprints_for(&self, candidate: &CandidateSchedule) -> Vec<SlotFootprint> {
        let rooms: HashSet<Ulid> = candidate.slots.iter().map(|s| s.room_id).collect();
        let ids = self
            .by_date
            .get(&candidate.date)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut footprints = Vec::new();
        for id in ids {
            let Some(rs) = self.get_schedule_state(&id) else {
                continue;
            };
            let guard = rs.read().await;
            if !guard.is_active {
                continue;
            }
            let relevant = guard.doctor_id == candidate.doctor_id
                || guard.slots.iter().any(|s| rooms.contains(&s.room_id));
            if relevant {
                footprints.extend(guard.footprints());
            }
        }
        footprints
    }

    /// Validate a candidate and report its conflicts. An empty report means
    /// the write may proceed; nothing is written either way.
    pub async fn validate_schedule(
        &self,
        candidate: &CandidateSchedule,
        exclude_schedule_id: Option<Ulid>,
    ) -> Result<Vec<Conflict>, EngineError> {
        validate_slots(&candidate.slots)?;
        let existing = self.footprints_for(candidate).await;
        Ok(detect_conflicts(candidate, &existing, exclude_schedule_id))
    }
}
