mod capacity;
mod conflict;
mod error;
mod locks;
mod queries;
mod schedules;

pub use conflict::{detect_conflicts, validate_slots};
pub use error::EngineError;
pub use locks::Subscription;
pub use queries::SlotContext;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<ScheduleState>>;

pub const DEFAULT_LOCK_TTL_MS: Ms = 5 * 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// How long a slot lock lives without being refreshed.
    pub lock_ttl_ms: Ms,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
        }
    }
}

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// An event handed to the WAL writer but not yet known to be durable.
pub(super) struct PendingWrite(oneshot::Receiver<io::Result<()>>);

impl PendingWrite {
    pub(super) async fn durable(self) -> Result<(), EngineError> {
        self.0
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}

/// Background task that owns the WAL. Takes the first queued append, drains
/// whatever else is already queued, then pays for a single fsync. Runs until
/// every sender is gone or a `Shutdown` arrives.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::UnboundedReceiver<WalCommand>) {
    let mut shutdown = None;
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            WalCommand::Shutdown { response } => {
                shutdown = Some(response);
                break;
            }
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let started = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        // Control commands queued behind the batch see it flushed first.
        match deferred {
            Some(WalCommand::Shutdown { response }) => {
                shutdown = Some(response);
                break;
            }
            Some(cmd) => handle_control(&mut wal, cmd),
            None => {}
        }
    }

    // Close the channel before acknowledging so every later write fails fast.
    drop(rx);
    if let Err(e) = wal.flush_sync() {
        tracing::error!("final WAL flush of {} failed: {e}", wal.path().display());
    }
    if let Some(response) = shutdown {
        tracing::info!("WAL writer stopped");
        let _ = response.send(());
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush regardless so a half-buffered batch never leaks into the next one.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = wal.rewrite(&events);
            if let Err(e) = &result {
                tracing::error!("WAL compaction of {} failed: {e}", wal.path().display());
            }
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } | WalCommand::Shutdown { .. } => {
            unreachable!("handled by the writer loop")
        }
    }
}

/// Fold one logged event into plain schedules. Used by replay only.
fn replay_event(schedules: &mut HashMap<Ulid, Schedule>, event: Event) {
    match event {
        Event::ScheduleCreated { schedule } => {
            schedules.insert(schedule.id, schedule);
        }
        Event::SlotsReplaced {
            schedule_id,
            hospital_id,
            time_slots,
        } => {
            if let Some(s) = schedules.get_mut(&schedule_id) {
                s.hospital_id = hospital_id;
                s.time_slots = time_slots;
            }
        }
        Event::ActivationChanged {
            schedule_id,
            is_active,
        } => {
            if let Some(s) = schedules.get_mut(&schedule_id) {
                s.is_active = is_active;
            }
        }
        Event::SlotReserved {
            schedule_id,
            time_slot_id,
            appointment_id,
        } => {
            if let Some(slot) = replay_slot(schedules, schedule_id, time_slot_id)
                && !slot.appointments.contains(&appointment_id)
            {
                slot.appointments.push(appointment_id);
            }
        }
        Event::SlotReleased {
            schedule_id,
            time_slot_id,
            appointment_id,
        } => {
            if let Some(slot) = replay_slot(schedules, schedule_id, time_slot_id) {
                slot.appointments.retain(|a| *a != appointment_id);
            }
        }
    }
}

fn replay_slot(
    schedules: &mut HashMap<Ulid, Schedule>,
    schedule_id: Ulid,
    time_slot_id: Ulid,
) -> Option<&mut TimeSlot> {
    schedules
        .get_mut(&schedule_id)?
        .time_slots
        .iter_mut()
        .find(|t| t.id == time_slot_id)
}

/// The scheduling core: schedule store, conflict validator, slot lock broker
/// and capacity controller over one shared in-memory state.
pub struct Engine {
    pub(super) schedules: DashMap<Ulid, SharedSchedule>,
    /// Date → every schedule on that date, active or not.
    pub(super) by_date: DashMap<NaiveDate, Vec<Ulid>>,
    /// Doctor+date → its single active schedule.
    pub(super) active: DashMap<ChannelKey, Ulid>,
    /// The one authoritative lock table. At most one lock per key.
    pub(super) locks: DashMap<SlotKey, SlotLock>,
    /// Serializes schedule writes so validate-then-insert cannot interleave.
    pub(super) admin: Mutex<()>,
    wal_tx: mpsc::UnboundedSender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub settings: EngineSettings,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::unbounded_channel();
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            schedules: DashMap::new(),
            by_date: DashMap::new(),
            active: DashMap::new(),
            locks: DashMap::new(),
            admin: Mutex::new(()),
            wal_tx,
            notify,
            settings,
        };

        let replayed = events.len();
        let mut schedules = HashMap::new();
        for event in events {
            replay_event(&mut schedules, event);
        }
        let count = schedules.len();
        for schedule in schedules.into_values() {
            engine.index_schedule(schedule);
        }
        if replayed > 0 {
            tracing::info!("replayed {replayed} WAL events into {count} schedules");
        }

        Ok(engine)
    }

    /// Make a schedule visible in the map and both indexes.
    pub(super) fn index_schedule(&self, schedule: Schedule) {
        self.by_date
            .entry(schedule.date)
            .or_default()
            .push(schedule.id);
        if schedule.is_active {
            self.active.insert(schedule.channel(), schedule.id);
        }
        self.schedules
            .insert(schedule.id, Arc::new(RwLock::new(schedule.into())));
    }

    /// Hand an event to the WAL writer without waiting. Callers enqueue while
    /// still inside their critical section so log order matches apply order,
    /// then await `durable()` after leaving it.
    pub(super) fn enqueue(&self, event: Event) -> Result<PendingWrite, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event,
                response: tx,
            })
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        Ok(PendingWrite(rx))
    }

    pub fn get_schedule_state(&self, id: &Ulid) -> Option<SharedSchedule> {
        self.schedules.get(id).map(|e| e.value().clone())
    }

    pub(super) fn require_schedule(&self, id: Ulid) -> Result<SharedSchedule, EngineError> {
        self.get_schedule_state(&id).ok_or(EngineError::NotFound(id))
    }

    /// Rewrite the WAL as one `ScheduleCreated` per schedule.
    ///
    /// Admin writes and every slot's booking list are held still while the
    /// snapshot is taken and the rewrite is queued, so no event can fall
    /// between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _admin = self.admin.lock().await;

        let shared: Vec<SharedSchedule> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut schedule_guards = Vec::with_capacity(shared.len());
        for rs in shared {
            schedule_guards.push(rs.read_owned().await);
        }

        let mut events = Vec::with_capacity(schedule_guards.len());
        let mut booking_guards = Vec::new();
        for guard in &schedule_guards {
            let mut time_slots = Vec::with_capacity(guard.slots.len());
            for slot in &guard.slots {
                let bookings = slot.bookings.clone().lock_owned().await;
                time_slots.push(TimeSlot {
                    id: slot.id,
                    range: slot.range,
                    room_id: slot.room_id,
                    max_bookings: slot.max_bookings,
                    appointments: bookings.to_vec(),
                });
                booking_guards.push(bookings);
            }
            events.push(Event::ScheduleCreated {
                schedule: Schedule {
                    id: guard.id,
                    doctor_id: guard.doctor_id,
                    hospital_id: guard.hospital_id,
                    date: guard.date,
                    is_active: guard.is_active,
                    time_slots,
                },
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        drop(booking_guards);
        drop(schedule_guards);

        PendingWrite(rx).durable().await
    }

    /// Stop the WAL writer once everything queued ahead of this call is on
    /// disk. Mutations after this fail with `WalError` and change nothing.
    pub async fn shutdown_wal(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::Shutdown { response: tx })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
