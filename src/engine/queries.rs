use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Where a slot lives: what an appointment needs to reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotContext {
    pub key: SlotKey,
    pub channel: ChannelKey,
    pub room_id: Ulid,
    pub range: TimeRange,
    pub is_active: bool,
}

impl Engine {
    pub async fn get_schedule(&self, id: Ulid) -> Option<Schedule> {
        let rs = self.get_schedule_state(&id)?;
        let guard = rs.read().await;
        Some(guard.snapshot().await)
    }

    /// Every schedule a doctor has on a date, active or not, oldest first.
    pub async fn schedules_for_channel(&self, channel: &ChannelKey) -> Vec<Schedule> {
        let ids = self
            .by_date
            .get(&channel.date)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut out = Vec::new();
        for id in ids {
            let Some(rs) = self.get_schedule_state(&id) else {
                continue;
            };
            let guard = rs.read().await;
            if guard.doctor_id == channel.doctor_id {
                out.push(guard.snapshot().await);
            }
        }
        out.sort_by_key(|s| s.id);
        out
    }

    /// The single active schedule for a doctor on a date, if any.
    pub fn active_schedule_id(&self, channel: &ChannelKey) -> Option<Ulid> {
        self.active.get(channel).map(|e| *e.value())
    }

    pub async fn slot_status(&self, key: SlotKey) -> Result<SlotStatus, EngineError> {
        let rs = self.require_schedule(key.schedule_id)?;
        let guard = rs.read().await;
        let slot = guard
            .slot(key.time_slot_id)
            .ok_or(EngineError::SlotNotFound(key))?;
        let bookings = slot.bookings.lock().await;
        Ok(slot.status_with(key.schedule_id, &bookings))
    }

    pub async fn slot_context(&self, key: SlotKey) -> Result<SlotContext, EngineError> {
        let rs = self.require_schedule(key.schedule_id)?;
        let guard = rs.read().await;
        let slot = guard
            .slot(key.time_slot_id)
            .ok_or(EngineError::SlotNotFound(key))?;
        Ok(SlotContext {
            key,
            channel: guard.channel(),
            room_id: slot.room_id,
            range: slot.range,
            is_active: guard.is_active,
        })
    }

    pub fn schedule_count(&self) -> usize {
        self.schedules.len()
    }
}
