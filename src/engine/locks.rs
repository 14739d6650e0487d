use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::debug;

use crate::limits::*;
use crate::model::*;
use crate::observability::{LOCKS_ACQUIRED_TOTAL, LOCKS_ACTIVE, LOCKS_EXPIRED_TOTAL, LOCKS_REJECTED_TOTAL};

use super::{now_ms, Engine, EngineError};

/// A channel subscription plus the lock state at the moment it started.
/// Events after the snapshot arrive on `receiver`; some may repeat state
/// already in the snapshot.
pub struct Subscription {
    pub channel: ChannelKey,
    pub receiver: broadcast::Receiver<Notification>,
    pub current_locks: Vec<SlotLock>,
}

fn validate_holder(holder_id: &str) -> Result<(), EngineError> {
    if holder_id.is_empty() {
        return Err(EngineError::InvalidIdentity("empty holder id"));
    }
    if holder_id.len() > MAX_IDENTITY_LEN {
        return Err(EngineError::InvalidIdentity("holder id too long"));
    }
    Ok(())
}

impl Engine {
    /// Register for a doctor+date channel. The receiver is created before the
    /// snapshot is read so nothing between the two is missed.
    pub fn subscribe(&self, channel: ChannelKey, client_id: &str) -> Subscription {
        let receiver = self.notify.subscribe(channel);
        let current_locks = self.current_locks(&channel);
        debug!(
            "{client_id} joined {channel} ({} live locks)",
            current_locks.len()
        );
        Subscription {
            channel,
            receiver,
            current_locks,
        }
    }

    /// Live locks on a channel.
    pub fn current_locks(&self, channel: &ChannelKey) -> Vec<SlotLock> {
        let now = now_ms();
        let mut locks: Vec<SlotLock> = self
            .locks
            .iter()
            .filter(|e| e.channel == *channel && !e.is_expired(now))
            .map(|e| e.value().clone())
            .collect();
        locks.sort_by_key(|l| l.key());
        locks
    }

    pub fn lock_holder(&self, key: &SlotKey) -> Option<String> {
        let now = now_ms();
        self.locks
            .get(key)
            .filter(|l| !l.is_expired(now))
            .map(|l| l.holder_id.clone())
    }

    fn live_locks_held_by(&self, holder_id: &str, except: &SlotKey, now: Ms) -> usize {
        self.locks
            .iter()
            .filter(|e| e.holder_id == holder_id && e.key() != except && !e.is_expired(now))
            .count()
    }

    /// Claim a slot for `holder_id`.
    ///
    /// Unlocked, expired, or already held by the same holder: granted, with a
    /// fresh expiry, and `locked` is broadcast. Held by someone else, or the
    /// slot is full: rejected, and nothing is broadcast.
    pub async fn acquire_lock(&self, key: SlotKey, holder_id: &str) -> Result<LockOutcome, EngineError> {
        validate_holder(holder_id)?;
        let rs = self.require_schedule(key.schedule_id)?;
        let guard = rs.read().await;
        if !guard.is_active {
            return Err(EngineError::ScheduleInactive(key.schedule_id));
        }
        let slot = guard
            .slot(key.time_slot_id)
            .ok_or(EngineError::SlotNotFound(key))?;

        // Held for the whole decision so a reservation filling the slot
        // cannot slip in between the capacity check and the grant.
        let bookings = slot.bookings.lock().await;
        if bookings.len() as u32 >= slot.max_bookings {
            return Ok(reject(key, holder_id, RejectReason::SlotFull));
        }

        let now = now_ms();
        if self.live_locks_held_by(holder_id, &key, now) >= MAX_LOCKS_PER_HOLDER {
            return Ok(reject(key, holder_id, RejectReason::TooManyLocks));
        }

        let lock = SlotLock {
            schedule_id: key.schedule_id,
            time_slot_id: key.time_slot_id,
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now + self.settings.lock_ttl_ms,
            channel: guard.channel(),
        };

        // The entry guard keeps the shard locked until the broadcast is out,
        // which is what orders events for the same key.
        match self.locks.entry(key) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.holder_id != holder_id && !current.is_expired(now) {
                    return Ok(reject(key, holder_id, RejectReason::HeldByOther));
                }
                entry.insert(lock.clone());
                self.notify.send(&lock.channel, Notification::locked(&lock));
            }
            Entry::Vacant(entry) => {
                let _held = entry.insert(lock.clone());
                self.notify.send(&lock.channel, Notification::locked(&lock));
                metrics::gauge!(LOCKS_ACTIVE).increment(1.0);
            }
        }
        drop(bookings);

        metrics::counter!(LOCKS_ACQUIRED_TOTAL).increment(1);
        debug!("{holder_id} locked {key} until {}", lock.expires_at);
        Ok(LockOutcome::Acquired(lock))
    }

    /// Release `holder_id`'s lock on `key`. Releasing a lock you do not hold
    /// is a no-op; returns whether a lock was actually released.
    pub fn release_lock(&self, key: &SlotKey, holder_id: &str) -> bool {
        match self.locks.entry(*key) {
            Entry::Occupied(entry) if entry.get().holder_id == holder_id => {
                self.notify
                    .send(&entry.get().channel, Notification::unlocked(*key));
                entry.remove();
                metrics::gauge!(LOCKS_ACTIVE).decrement(1.0);
                debug!("{holder_id} released {key}");
                true
            }
            _ => false,
        }
    }

    /// Release every lock held by `holder_id`. Used when its connection drops.
    pub fn release_holder_locks(&self, holder_id: &str) -> usize {
        let keys: Vec<SlotKey> = self
            .locks
            .iter()
            .filter(|e| e.holder_id == holder_id)
            .map(|e| *e.key())
            .collect();
        keys.iter()
            .filter(|key| self.release_lock(key, holder_id))
            .count()
    }

    /// Force-release a lock regardless of holder (slot filled, removed or
    /// its schedule deactivated).
    pub(super) fn drop_lock(&self, key: &SlotKey) -> Option<SlotLock> {
        match self.locks.entry(*key) {
            Entry::Occupied(entry) => {
                self.notify
                    .send(&entry.get().channel, Notification::unlocked(*key));
                let lock = entry.remove();
                metrics::gauge!(LOCKS_ACTIVE).decrement(1.0);
                Some(lock)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Force-release every lock whose expiry is at or before `now`, broadcasting
    /// `unlocked` for each exactly as an explicit release would.
    pub fn sweep_expired_locks(&self, now: Ms) -> Vec<SlotLock> {
        let expired: Vec<SlotKey> = self
            .locks
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| *e.key())
            .collect();

        let mut released = Vec::with_capacity(expired.len());
        for key in expired {
            // Re-check under the entry lock: the holder may have refreshed it.
            if let Entry::Occupied(entry) = self.locks.entry(key)
                && entry.get().is_expired(now)
            {
                self.notify
                    .send(&entry.get().channel, Notification::unlocked(key));
                released.push(entry.remove());
                metrics::gauge!(LOCKS_ACTIVE).decrement(1.0);
                metrics::counter!(LOCKS_EXPIRED_TOTAL).increment(1);
            }
        }
        released
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

fn reject(key: SlotKey, holder_id: &str, reason: RejectReason) -> LockOutcome {
    let label = match reason {
        RejectReason::HeldByOther => "held_by_other",
        RejectReason::SlotFull => "slot_full",
        RejectReason::TooManyLocks => "too_many_locks",
    };
    metrics::counter!(LOCKS_REJECTED_TOTAL, "reason" => label).increment(1);
    debug!("lock on {key} rejected for {holder_id}: {reason}");
    LockOutcome::Rejected(reason)
}
