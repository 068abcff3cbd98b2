use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::warn;
use ulid::Ulid;

use crate::engine::conflict::{check_appointments_clear, check_no_conflict, find_slot_conflict};
use crate::engine::{ConflictReason, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::{ScheduleStore, StatusChange};

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
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
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes the first queued append, drains whatever else is already waiting,
/// and commits the lot with one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
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

        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes never join the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Store ────────────────────────────────────────────────

struct Inner {
    providers: DashMap<UserId, SharedProviderState>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Slot or appointment id → owning provider.
    entity_to_provider: DashMap<Ulid, UserId>,
    /// Requester → their appointment ids, in booking order.
    by_requester: DashMap<UserId, Vec<AppointmentId>>,
    next_seq: AtomicU64,
    /// Commits hold it shared; compaction holds it exclusively so no append slips between
    /// the snapshot and the file swap.
    gate: Arc<RwLock<()>>,
}

/// Durable [`ScheduleStore`]: per-provider state behind a `RwLock`, every change written to
/// the WAL before it becomes visible.
///
/// The provider's write lock is the serialization point for conditional writes. The WAL
/// append and the in-memory apply run in a detached task, so a caller that gives up
/// after submitting a commit never leaves the log and memory disagreeing.
pub struct WalStore {
    inner: Arc<Inner>,
}

/// Hold on a client-supplied id from validation until its commit lands. Dropping it
/// without [`IdReservation::commit`] frees the id again.
struct IdReservation {
    inner: Arc<Inner>,
    id: Ulid,
    committed: bool,
}

impl IdReservation {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for IdReservation {
    fn drop(&mut self) {
        if !self.committed {
            self.inner.entity_to_provider.remove(&self.id);
        }
    }
}

impl Inner {
    /// Ids are unique across slots and appointments of every provider. The vacant-entry
    /// insert is atomic, so of two writers racing on one id exactly one gets it.
    fn reserve_id(
        self: &Arc<Self>,
        id: Ulid,
        provider_id: UserId,
    ) -> Result<IdReservation, EngineError> {
        match self.entity_to_provider.entry(id) {
            Entry::Occupied(_) => Err(EngineError::Validation(format!("id {id} already exists"))),
            Entry::Vacant(vacant) => {
                vacant.insert(provider_id);
                Ok(IdReservation {
                    inner: self.clone(),
                    id,
                    committed: false,
                })
            }
        }
    }

    fn provider(&self, provider_id: &UserId) -> Option<SharedProviderState> {
        self.providers.get(provider_id).map(|e| e.value().clone())
    }

    fn provider_or_create(&self, provider_id: UserId) -> SharedProviderState {
        self.providers
            .entry(provider_id)
            .or_insert_with(|| Arc::new(RwLock::new(ProviderState::new(provider_id))))
            .clone()
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Transport("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Transport("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    /// Apply an event to provider state. The caller holds the provider's write lock.
    fn apply(&self, ps: &mut ProviderState, event: &Event) {
        match event {
            Event::SlotAdded {
                id,
                provider_id,
                range,
                seq,
            } => {
                self.bump_seq(*seq);
                ps.insert_slot(Slot {
                    id: *id,
                    provider_id: *provider_id,
                    range: *range,
                    status: SlotStatus::Open,
                    seq: *seq,
                });
                self.entity_to_provider.insert(*id, *provider_id);
            }
            Event::SlotRemoved { id, .. } => {
                ps.remove_slot(*id);
                self.entity_to_provider.remove(id);
            }
            Event::SlotClaimed {
                slot_id,
                appointment,
                ..
            } => {
                if let Some(slot) = ps.slot_mut(*slot_id) {
                    slot.status = SlotStatus::Claimed;
                }
                self.index_appointment(appointment);
                ps.insert_appointment(appointment.clone());
            }
            Event::AppointmentStatusChanged {
                id,
                status,
                notes,
                reopened_slot,
                ..
            } => {
                if let Some(appt) = ps.appointment_mut(*id) {
                    appt.status = *status;
                    appt.notes = notes.clone();
                }
                if let Some(slot) = reopened_slot.and_then(|sid| ps.slot_mut(sid)) {
                    slot.status = SlotStatus::Open;
                }
            }
            Event::SlotRestored { slot } => {
                self.bump_seq(slot.seq);
                ps.remove_slot(slot.id);
                self.entity_to_provider.insert(slot.id, slot.provider_id);
                ps.insert_slot(slot.clone());
            }
            Event::AppointmentRestored { appointment } => {
                self.index_appointment(appointment);
                ps.insert_appointment(appointment.clone());
            }
        }
    }

    fn bump_seq(&self, seq: u64) {
        self.next_seq.fetch_max(seq + 1, Ordering::SeqCst);
    }

    fn index_appointment(&self, appointment: &Appointment) {
        self.entity_to_provider
            .insert(appointment.id, appointment.provider_id);
        let mut ids = self.by_requester.entry(appointment.requester_id).or_default();
        if !ids.contains(&appointment.id) {
            ids.push(appointment.id);
        }
    }

    /// Append + apply in a task of its own. `output` is handed back once both succeeded.
    /// A new entity's id reservation travels with the task and is kept only on success.
    async fn commit<T: Send + 'static>(
        self: Arc<Self>,
        gate: OwnedRwLockReadGuard<()>,
        mut guard: OwnedRwLockWriteGuard<ProviderState>,
        reservation: Option<IdReservation>,
        event: Event,
        output: T,
    ) -> Result<T, EngineError> {
        tokio::spawn(async move {
            let _gate = gate;
            self.wal_append(&event).await?;
            self.apply(&mut guard, &event);
            if let Some(reservation) = reservation {
                reservation.commit();
            }
            Ok::<T, EngineError>(output)
        })
        .await
        .map_err(|e| EngineError::Transport(format!("commit task failed: {e}")))?
    }

    /// Entity id → provider → write lock.
    async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let provider_id = self
            .entity_to_provider
            .get(entity_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ps = self
            .provider(&provider_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        Ok(ps.write_owned().await)
    }

    async fn resolve_entity_read(
        &self,
        entity_id: &Ulid,
    ) -> Option<OwnedRwLockReadGuard<ProviderState>> {
        let provider_id = self.entity_to_provider.get(entity_id).map(|e| *e.value())?;
        let ps = self.provider(&provider_id)?;
        Some(ps.read_owned().await)
    }
}

impl WalStore {
    /// Replay the log at `wal_path` and start its group-commit writer. Needs a tokio runtime.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let inner = Arc::new(Inner {
            providers: DashMap::new(),
            wal_tx,
            entity_to_provider: DashMap::new(),
            by_requester: DashMap::new(),
            next_seq: AtomicU64::new(0),
            gate: Arc::new(RwLock::new(())),
        });

        // Sole owner of every lock here, so try_write never contends. blocking_write would
        // panic when this runs inside an async context.
        for event in &events {
            let ps = inner.provider_or_create(event.provider_id());
            let mut guard = ps
                .try_write()
                .map_err(|_| io::Error::other("replay: provider state locked"))?;
            inner.apply(&mut guard, event);
        }

        Ok(Self { inner })
    }

    pub fn provider_count(&self) -> usize {
        self.inner.providers.len()
    }

    async fn enter(&self) -> OwnedRwLockReadGuard<()> {
        self.inner.gate.clone().read_owned().await
    }

    /// Rewrite the WAL as one restore record per live slot and appointment.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let _exclusive = self.inner.gate.write().await;

        let mut provider_ids: Vec<UserId> =
            self.inner.providers.iter().map(|e| *e.key()).collect();
        provider_ids.sort();

        let mut events = Vec::new();
        for provider_id in provider_ids {
            let Some(ps) = self.inner.provider(&provider_id) else {
                continue;
            };
            let guard = ps.read().await;
            events.extend(guard.slots.iter().map(|slot| Event::SlotRestored { slot: slot.clone() }));
            events.extend(guard.appointments.iter().map(|appointment| {
                Event::AppointmentRestored {
                    appointment: appointment.clone(),
                }
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Transport("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Transport("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl ScheduleStore for WalStore {
    async fn insert_slot_if_no_conflict(
        &self,
        id: SlotId,
        provider_id: UserId,
        range: TimeRange,
    ) -> Result<Slot, EngineError> {
        let gate = self.enter().await;
        let reservation = self.inner.reserve_id(id, provider_id)?;
        let guard = self.inner.provider_or_create(provider_id).write_owned().await;
        if guard.slots.len() >= MAX_SLOTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many slots for provider"));
        }

        check_no_conflict(&guard, &range)?;

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let slot = Slot {
            id,
            provider_id,
            range,
            status: SlotStatus::Open,
            seq,
        };
        let event = Event::SlotAdded {
            id,
            provider_id,
            range,
            seq,
        };
        self.inner
            .clone()
            .commit(gate, guard, Some(reservation), event, slot)
            .await
    }

    async fn remove_slot_if_open(&self, slot_id: SlotId) -> Result<Slot, EngineError> {
        let gate = self.enter().await;
        let guard = self.inner.resolve_entity_write(&slot_id).await?;
        let slot = guard
            .slot(slot_id)
            .cloned()
            .ok_or(EngineError::NotFound(slot_id))?;
        if !slot.is_open() {
            return Err(EngineError::State(format!("slot {slot_id} is claimed")));
        }

        let event = Event::SlotRemoved {
            id: slot_id,
            provider_id: slot.provider_id,
        };
        self.inner.clone().commit(gate, guard, None, event, slot).await
    }

    async fn claim_slot_and_insert_appointment(
        &self,
        appointment: Appointment,
    ) -> Result<Appointment, EngineError> {
        let gate = self.enter().await;
        let ps = self
            .inner
            .provider(&appointment.provider_id)
            .ok_or(EngineError::NotFound(appointment.slot_id))?;
        let reservation = self
            .inner
            .reserve_id(appointment.id, appointment.provider_id)?;
        let guard = ps.write_owned().await;

        // Compare-and-swap: the claim only lands if the slot is still Open right now.
        let slot = guard
            .slot(appointment.slot_id)
            .ok_or(EngineError::NotFound(appointment.slot_id))?;
        if !slot.is_open() {
            return Err(EngineError::already_booked());
        }
        if slot.range != appointment.range {
            return Err(EngineError::State(format!(
                "appointment range {} differs from slot range {}",
                appointment.range, slot.range
            )));
        }
        check_appointments_clear(&guard, &slot.range, None)?;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many appointments for provider"));
        }

        let event = Event::SlotClaimed {
            slot_id: appointment.slot_id,
            provider_id: appointment.provider_id,
            appointment: appointment.clone(),
        };
        self.inner
            .clone()
            .commit(gate, guard, Some(reservation), event, appointment)
            .await
    }

    async fn update_appointment_status(
        &self,
        change: StatusChange,
    ) -> Result<Appointment, EngineError> {
        let gate = self.enter().await;
        let id = change.appointment_id;
        let guard = self.inner.resolve_entity_write(&id).await?;
        let current = guard
            .appointment(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if current.status != change.expected {
            return Err(EngineError::Conflict(ConflictReason::StatusChanged));
        }

        let notes = match change.note.as_deref() {
            Some(note) => append_note(&current.notes, note),
            None => current.notes.clone(),
        };
        if notes.len() > MAX_NOTES_LEN {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        let reopened_slot = if change.reopen_slot && change.next == AppointmentStatus::Cancelled {
            reopenable_slot(&guard, &current)
        } else {
            None
        };

        let updated = Appointment {
            status: change.next,
            notes: notes.clone(),
            ..current
        };
        let event = Event::AppointmentStatusChanged {
            id,
            provider_id: updated.provider_id,
            status: change.next,
            notes,
            reopened_slot,
        };
        self.inner.clone().commit(gate, guard, None, event, updated).await
    }

    async fn get_slot(&self, id: SlotId) -> Result<Option<Slot>, EngineError> {
        Ok(self
            .inner
            .resolve_entity_read(&id)
            .await
            .and_then(|guard| guard.slot(id).cloned()))
    }

    async fn get_appointment(&self, id: AppointmentId) -> Result<Option<Appointment>, EngineError> {
        Ok(self
            .inner
            .resolve_entity_read(&id)
            .await
            .and_then(|guard| guard.appointment(id).cloned()))
    }

    async fn list_slots_by_provider(
        &self,
        provider_id: UserId,
        window: TimeRange,
    ) -> Result<Vec<Slot>, EngineError> {
        let Some(ps) = self.inner.provider(&provider_id) else {
            return Ok(Vec::new());
        };
        let guard = ps.read().await;
        Ok(guard.slots_overlapping(&window).cloned().collect())
    }

    async fn list_appointments_by_provider(
        &self,
        provider_id: UserId,
    ) -> Result<Vec<Appointment>, EngineError> {
        let Some(ps) = self.inner.provider(&provider_id) else {
            return Ok(Vec::new());
        };
        let guard = ps.read().await;
        Ok(guard.appointments.clone())
    }

    async fn list_appointments_by_requester(
        &self,
        requester_id: UserId,
    ) -> Result<Vec<Appointment>, EngineError> {
        let ids = self
            .inner
            .by_requester
            .get(&requester_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(appt) = self.get_appointment(id).await? {
                out.push(appt);
            }
        }
        out.sort_by_key(|a| a.range.start);
        Ok(out)
    }

    async fn list_all_appointments(&self) -> Result<Vec<Appointment>, EngineError> {
        let states: Vec<SharedProviderState> =
            self.inner.providers.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ps in states {
            out.extend(ps.read().await.appointments.iter().cloned());
        }
        out.sort_by_key(|a| a.range.start);
        Ok(out)
    }

    async fn provider_state(&self, provider_id: UserId) -> Result<ProviderState, EngineError> {
        match self.inner.provider(&provider_id) {
            Some(ps) => Ok(ps.read().await.clone()),
            None => Ok(ProviderState::new(provider_id)),
        }
    }
}

/// The slot behind `appointment`, if it can go back to Open without breaking the
/// no-overlapping-open-slots invariant.
fn reopenable_slot(ps: &ProviderState, appointment: &Appointment) -> Option<SlotId> {
    let slot = ps.slot(appointment.slot_id)?;
    if slot.is_open() {
        return None;
    }
    if let Some(other) = find_slot_conflict(ps, &slot.range, Some(slot.id)) {
        warn!(
            "slot {} stays claimed: open slot {} now overlaps it",
            slot.id, other.id
        );
        return None;
    }
    if check_appointments_clear(ps, &slot.range, Some(appointment.id)).is_err() {
        warn!("slot {} stays claimed: an active appointment overlaps it", slot.id);
        return None;
    }
    Some(slot.id)
}
