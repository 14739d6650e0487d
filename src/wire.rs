use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::appointments::Appointment;
use crate::booking::{BookingError, BookingOrchestrator};
use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::observability::{request_label, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};

/// Frames queued for one connection by its channel forwarders.
const OUTBOUND_BUFFER: usize = 64;

/// Client → server. One JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Must come first. The identity is opaque and already authenticated.
    Identify { client_id: String },
    JoinChannel { doctor_id: Ulid, date: NaiveDate },
    LeaveChannel { doctor_id: Ulid, date: NaiveDate },
    AcquireLock { schedule_id: Ulid, time_slot_id: Ulid },
    ReleaseLock { schedule_id: Ulid, time_slot_id: Ulid },
    SubmitBooking {
        schedule_id: Ulid,
        time_slot_id: Ulid,
        #[serde(default)]
        notes: Option<String>,
    },
    CancelBooking { appointment_id: Ulid },
    RescheduleBooking {
        appointment_id: Ulid,
        schedule_id: Ulid,
        time_slot_id: Ulid,
    },
    ValidateSchedule {
        candidate: CandidateSchedule,
        #[serde(default)]
        exclude_schedule_id: Option<Ulid>,
    },
    CreateSchedule { candidate: CandidateSchedule },
    UpdateSchedule {
        schedule_id: Ulid,
        #[serde(default)]
        hospital_id: Option<Ulid>,
        slots: Vec<SlotDraft>,
    },
    SetScheduleActive { schedule_id: Ulid, active: bool },
    GetSchedules { doctor_id: Ulid, date: NaiveDate },
}

/// A lock as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockView {
    pub schedule_id: Ulid,
    pub time_slot_id: Ulid,
    pub holder_id: String,
    pub expires_at: Ms,
}

impl From<&SlotLock> for LockView {
    fn from(lock: &SlotLock) -> Self {
        Self {
            schedule_id: lock.schedule_id,
            time_slot_id: lock.time_slot_id,
            holder_id: lock.holder_id.clone(),
            expires_at: lock.expires_at,
        }
    }
}

/// A slot as shown to clients: its occupancy, never whose appointments fill it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub id: Ulid,
    pub range: TimeRange,
    pub room_id: Ulid,
    pub max_bookings: u32,
    pub booked_count: u32,
    pub is_full: bool,
}

impl From<&TimeSlot> for SlotView {
    fn from(slot: &TimeSlot) -> Self {
        Self {
            id: slot.id,
            range: slot.range,
            room_id: slot.room_id,
            max_bookings: slot.max_bookings,
            booked_count: slot.booked_count(),
            is_full: slot.is_full(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleView {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub hospital_id: Ulid,
    pub date: NaiveDate,
    pub is_active: bool,
    pub time_slots: Vec<SlotView>,
}

impl From<Schedule> for ScheduleView {
    fn from(schedule: Schedule) -> Self {
        Self {
            id: schedule.id,
            doctor_id: schedule.doctor_id,
            hospital_id: schedule.hospital_id,
            date: schedule.date,
            is_active: schedule.is_active,
            time_slots: schedule.time_slots.iter().map(SlotView::from).collect(),
        }
    }
}

/// Server → client answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Identified {
        client_id: String,
    },
    CurrentLocks {
        doctor_id: Ulid,
        date: NaiveDate,
        locks: Vec<LockView>,
    },
    LeftChannel {
        doctor_id: Ulid,
        date: NaiveDate,
    },
    LockAcquired {
        schedule_id: Ulid,
        time_slot_id: Ulid,
        holder_id: String,
        expires_at: Ms,
    },
    LockRejected {
        schedule_id: Ulid,
        time_slot_id: Ulid,
        reason: RejectReason,
    },
    LockReleased {
        schedule_id: Ulid,
        time_slot_id: Ulid,
        released: bool,
    },
    BookingConfirmed {
        appointment: Appointment,
    },
    BookingRejected {
        schedule_id: Ulid,
        time_slot_id: Ulid,
        reason: RejectReason,
    },
    BookingCancelled {
        appointment: Appointment,
    },
    Conflicts {
        conflicts: Vec<Conflict>,
    },
    Schedule {
        schedule: ScheduleView,
    },
    Schedules {
        schedules: Vec<ScheduleView>,
    },
    Error {
        kind: &'static str,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conflicts: Option<Vec<Conflict>>,
    },
}

impl Reply {
    fn error(kind: &'static str, message: impl Into<String>) -> Self {
        Reply::Error {
            kind,
            message: message.into(),
            conflicts: None,
        }
    }

    fn current_locks(channel: ChannelKey, locks: &[SlotLock]) -> Self {
        Reply::CurrentLocks {
            doctor_id: channel.doctor_id,
            date: channel.date,
            locks: locks.iter().map(LockView::from).collect(),
        }
    }
}

impl From<EngineError> for Reply {
    fn from(e: EngineError) -> Self {
        let kind = e.kind();
        let message = e.to_string();
        let conflicts = match e {
            EngineError::Conflicts(c) => Some(c),
            _ => None,
        };
        Reply::Error {
            kind,
            message,
            conflicts,
        }
    }
}

impl From<BookingError> for Reply {
    fn from(e: BookingError) -> Self {
        match e {
            BookingError::SlotFull(key) => Reply::BookingRejected {
                schedule_id: key.schedule_id,
                time_slot_id: key.time_slot_id,
                reason: RejectReason::SlotFull,
            },
            BookingError::Engine(e) => e.into(),
            other => Reply::error(other.kind(), other.to_string()),
        }
    }
}

/// Everything a connection writes: direct replies and channel broadcasts.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum Outbound {
    Reply(Reply),
    Event(Notification),
}

#[derive(Default)]
struct Session {
    client_id: Option<String>,
    forwarders: HashMap<ChannelKey, JoinHandle<()>>,
}

/// Serve one client until it disconnects. Whatever happens, every channel
/// forwarder is stopped and every lock held under the connection's identity
/// is released on the way out.
pub async fn process_connection(socket: TcpStream, booking: Arc<BookingOrchestrator>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let mut session = Session::default();

    let result = loop {
        tokio::select! {
            frame = framed.next() => {
                let line = match frame {
                    None => break Ok(()),
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let reply = Reply::error("limit", format!("frame exceeds {MAX_FRAME_LEN} bytes"));
                        if let Err(e) = write(&mut framed, &Outbound::Reply(reply)).await {
                            break Err(e);
                        }
                        continue;
                    }
                    Some(Err(LinesCodecError::Io(e))) => break Err(e),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = session.handle(&line, &booking, &out_tx).await;
                if let Err(e) = write(&mut framed, &Outbound::Reply(reply)).await {
                    break Err(e);
                }
            }
            Some(out) = out_rx.recv() => {
                if let Err(e) = write(&mut framed, &out).await {
                    break Err(e);
                }
            }
        }
    };

    session.close(&booking.engine);
    result
}

async fn write(framed: &mut Framed<TcpStream, LinesCodec>, out: &Outbound) -> io::Result<()> {
    let line = serde_json::to_string(out).map_err(io::Error::other)?;
    framed.send(line).await.map_err(|e| match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::other(other),
    })
}

impl Session {
    async fn handle(
        &mut self,
        line: &str,
        booking: &BookingOrchestrator,
        out_tx: &mpsc::Sender<Outbound>,
    ) -> Reply {
        let req: Request = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => return Reply::error("validation", format!("malformed request: {e}")),
        };

        let label = request_label(&req);
        let started = Instant::now();
        let reply = self.dispatch(req, booking, out_tx).await;
        let status = if matches!(reply, Reply::Error { .. }) { "error" } else { "ok" };
        metrics::counter!(REQUESTS_TOTAL, "request" => label, "status" => status).increment(1);
        metrics::histogram!(REQUEST_DURATION_SECONDS, "request" => label)
            .record(started.elapsed().as_secs_f64());
        reply
    }

    async fn dispatch(
        &mut self,
        req: Request,
        booking: &BookingOrchestrator,
        out_tx: &mpsc::Sender<Outbound>,
    ) -> Reply {
        let engine = &booking.engine;

        let client_id = match &self.client_id {
            Some(id) => id.clone(),
            None if !matches!(req, Request::Identify { .. }) => {
                return Reply::error("validation", "identify first");
            }
            None => String::new(),
        };

        match req {
            Request::Identify { client_id } => self.identify(&client_id),

            Request::JoinChannel { doctor_id, date } => {
                let channel = ChannelKey::new(doctor_id, date);
                if self.forwarders.contains_key(&channel) {
                    return Reply::current_locks(channel, &engine.current_locks(&channel));
                }
                if self.forwarders.len() >= MAX_CHANNELS_PER_CONNECTION {
                    return Reply::error("limit", "too many channels on this connection");
                }
                let sub = engine.subscribe(channel, &client_id);
                let reply = Reply::current_locks(channel, &sub.current_locks);
                let forwarder = tokio::spawn(forward(
                    engine.clone(),
                    channel,
                    sub.receiver,
                    out_tx.clone(),
                ));
                self.forwarders.insert(channel, forwarder);
                reply
            }

            Request::LeaveChannel { doctor_id, date } => {
                let channel = ChannelKey::new(doctor_id, date);
                if let Some(forwarder) = self.forwarders.remove(&channel) {
                    forwarder.abort();
                    engine.notify.remove_if_idle(&channel);
                }
                Reply::LeftChannel { doctor_id, date }
            }

            Request::AcquireLock {
                schedule_id,
                time_slot_id,
            } => match engine
                .acquire_lock(SlotKey::new(schedule_id, time_slot_id), &client_id)
                .await
            {
                Ok(LockOutcome::Acquired(lock)) => Reply::LockAcquired {
                    schedule_id,
                    time_slot_id,
                    holder_id: lock.holder_id,
                    expires_at: lock.expires_at,
                },
                Ok(LockOutcome::Rejected(reason)) => Reply::LockRejected {
                    schedule_id,
                    time_slot_id,
                    reason,
                },
                Err(e) => e.into(),
            },

            Request::ReleaseLock {
                schedule_id,
                time_slot_id,
            } => Reply::LockReleased {
                schedule_id,
                time_slot_id,
                released: engine.release_lock(&SlotKey::new(schedule_id, time_slot_id), &client_id),
            },

            Request::SubmitBooking {
                schedule_id,
                time_slot_id,
                notes,
            } => match booking
                .submit(SlotKey::new(schedule_id, time_slot_id), &client_id, notes)
                .await
            {
                Ok(appointment) => Reply::BookingConfirmed { appointment },
                Err(e) => e.into(),
            },

            Request::CancelBooking { appointment_id } => match booking
                .cancel(appointment_id, &client_id)
                .await
            {
                Ok(appointment) => Reply::BookingCancelled { appointment },
                Err(e) => e.into(),
            },

            Request::RescheduleBooking {
                appointment_id,
                schedule_id,
                time_slot_id,
            } => match booking
                .reschedule(
                    appointment_id,
                    SlotKey::new(schedule_id, time_slot_id),
                    &client_id,
                )
                .await
            {
                Ok(appointment) => Reply::BookingConfirmed { appointment },
                Err(e) => e.into(),
            },

            Request::ValidateSchedule {
                candidate,
                exclude_schedule_id,
            } => match engine.validate_schedule(&candidate, exclude_schedule_id).await {
                Ok(conflicts) => Reply::Conflicts { conflicts },
                Err(e) => e.into(),
            },

            Request::CreateSchedule { candidate } => match engine.create_schedule(candidate).await {
                Ok(schedule) => Reply::Schedule {
                    schedule: schedule.into(),
                },
                Err(e) => e.into(),
            },

            Request::UpdateSchedule {
                schedule_id,
                hospital_id,
                slots,
            } => match engine.update_schedule(schedule_id, hospital_id, slots).await {
                Ok(schedule) => Reply::Schedule {
                    schedule: schedule.into(),
                },
                Err(e) => e.into(),
            },

            Request::SetScheduleActive {
                schedule_id,
                active,
            } => match engine.set_schedule_active(schedule_id, active).await {
                Ok(schedule) => Reply::Schedule {
                    schedule: schedule.into(),
                },
                Err(e) => e.into(),
            },

            Request::GetSchedules { doctor_id, date } => Reply::Schedules {
                schedules: engine
                    .schedules_for_channel(&ChannelKey::new(doctor_id, date))
                    .await
                    .into_iter()
                    .map(ScheduleView::from)
                    .collect(),
            },
        }
    }

    fn identify(&mut self, client_id: &str) -> Reply {
        if client_id.is_empty() || client_id.len() > MAX_IDENTITY_LEN {
            return Reply::error(
                "validation",
                format!("client_id must be 1-{MAX_IDENTITY_LEN} bytes"),
            );
        }
        if let Some(existing) = &self.client_id
            && existing != client_id
        {
            return Reply::error("validation", "connection already identified");
        }
        debug!("connection identified as {client_id}");
        self.client_id = Some(client_id.to_string());
        Reply::Identified {
            client_id: client_id.to_string(),
        }
    }

    /// Disconnect: stop forwarding, then release the identity's locks.
    fn close(self, engine: &Engine) {
        for (channel, forwarder) in self.forwarders {
            forwarder.abort();
            engine.notify.remove_if_idle(&channel);
        }
        if let Some(client_id) = self.client_id {
            let released = engine.release_holder_locks(&client_id);
            if released > 0 {
                info!("{client_id} disconnected, released {released} lock(s)");
            }
        }
    }
}

/// Pump one channel's broadcasts into the connection's outbound queue. A
/// subscriber that falls behind gets a fresh snapshot instead of the events
/// it missed.
async fn forward(
    engine: Arc<Engine>,
    channel: ChannelKey,
    mut rx: broadcast::Receiver<Notification>,
    out_tx: mpsc::Sender<Outbound>,
) {
    loop {
        let out = match rx.recv().await {
            Ok(notification) => Outbound::Event(notification),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("subscriber on {channel} lagged by {missed} events, resending snapshot");
                Outbound::Reply(Reply::current_locks(channel, &engine.current_locks(&channel)))
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if out_tx.send(out).await.is_err() {
            break;
        }
    }
}
