mod availability;
mod catalog;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;

pub use availability::{free_spans, merge_overlapping, subtract_intervals};
pub use catalog::EstablishmentState;
pub use conflict::now_ms;
pub use error::EngineError;
pub use mutations::ReserveRequest;
pub use queries::SlotQuery;
pub use slots::generate_slots;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::limits::WAL_CHANNEL_CAPACITY;
use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<Ledger>>;
pub type SharedEstablishment = Arc<RwLock<EstablishmentState>>;

// ── Group-commit WAL channel ─────────────────────────────

type Responder = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: Responder,
    },
    Compact {
        events: Vec<Event>,
        response: Responder,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Answer every sender with the batch result.
///
/// A non-append command found while draining closes the batch; it runs
/// after the batch is durable, so compaction never races buffered bytes.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
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

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!(path = %wal.path().display(), "WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, Responder)>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut failure = None;
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            failure = Some(e);
            break;
        }
    }
    // The batch is acknowledged as a whole, so one bad record drops it all.
    if failure.is_some() {
        wal.discard_buffered();
    } else {
        failure = wal.flush_sync().err();
    }
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if let Some(e) = &failure {
        tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
    }
    for (_, tx) in batch {
        let reply = match &failure {
            None => Ok(()),
            Some(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed outside a batch")));
        }
    }
}

/// Hand `event` to the writer task and wait until it is durable.
pub(super) async fn wal_append(
    wal_tx: &mpsc::Sender<WalCommand>,
    event: Event,
) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { event, response: tx })
        .await
        .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::Storage(e.to_string()))
}

// ── State application ────────────────────────────────────

/// Apply an appointment event to its ledger. Caller holds the write lock.
pub(super) fn apply_to_ledger(ledger: &mut Ledger, event: &Event) {
    match event {
        Event::AppointmentBooked {
            id,
            scope,
            service_id,
            client_id,
            span,
            created_at,
        } => ledger.insert(Appointment {
            id: *id,
            scope: *scope,
            service_id: *service_id,
            client_id: *client_id,
            span: *span,
            created_at: *created_at,
            cancellation: None,
        }),
        Event::AppointmentCancelled {
            id, actor_id, at, ..
        } => {
            if let Some(appointment) = ledger.get_mut(*id) {
                appointment.cancellation = Some(Cancellation {
                    actor_id: *actor_id,
                    at: *at,
                });
            }
        }
        _ => {}
    }
}

/// Apply a catalog event to its establishment. Caller holds the write lock.
pub(super) fn apply_to_establishment(est: &mut EstablishmentState, event: &Event) {
    match event {
        Event::StaffAdded {
            id,
            establishment_id,
            name,
        } => {
            est.staff.insert(
                *id,
                StaffMember {
                    id: *id,
                    establishment_id: *establishment_id,
                    name: name.clone(),
                    services: Default::default(),
                },
            );
        }
        Event::ServiceCreated {
            id,
            establishment_id,
            name,
            duration_minutes,
            price_minor_units,
        } => {
            est.services.insert(
                *id,
                Service {
                    id: *id,
                    establishment_id: *establishment_id,
                    name: name.clone(),
                    duration_minutes: *duration_minutes,
                    price_minor_units: *price_minor_units,
                },
            );
        }
        Event::ServiceRemoved { id, .. } => {
            est.services.remove(id);
            for member in est.staff.values_mut() {
                member.services.remove(id);
            }
        }
        Event::ServiceAssigned {
            staff_id,
            service_id,
            ..
        } => {
            if let Some(member) = est.staff.get_mut(staff_id) {
                member.services.insert(*service_id);
            }
        }
        Event::WindowAdded {
            id,
            establishment_id,
            day_of_week,
            start,
            end,
        } => est.rules.insert(AvailabilityWindow {
            id: *id,
            establishment_id: *establishment_id,
            day_of_week: *day_of_week,
            start: *start,
            end: *end,
        }),
        Event::WindowRemoved { id, .. } => {
            est.rules.remove(*id);
        }
        _ => {}
    }
}

/// The scheduling engine of one tenant partition.
///
/// Catalog data lives per establishment behind its own lock; appointments
/// live per resource scope, so reservations on different scopes never
/// contend.
pub struct Engine {
    pub(super) establishments: DashMap<Ulid, SharedEstablishment>,
    /// Staff, service and window id → owning establishment.
    pub(super) catalog_index: DashMap<Ulid, Ulid>,
    pub(super) ledgers: DashMap<ResourceScope, SharedLedger>,
    /// Appointment id → scope. Shared with in-flight commit tasks.
    pub(super) appointment_index: Arc<DashMap<Ulid, ResourceScope>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every persist-and-apply section and exclusively by
    /// compaction, so a snapshot never misses an acknowledged event.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> io::Result<Self> {
        let (wal, events) = Wal::recover::<Event>(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            establishments: DashMap::new(),
            catalog_index: DashMap::new(),
            ledgers: DashMap::new(),
            appointment_index: Arc::new(DashMap::new()),
            wal_tx,
            commit_gate: Arc::new(RwLock::new(())),
            config,
        };

        let replayed = events.len();
        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            path = %wal_path.display(),
            events = replayed,
            establishments = engine.establishments.len(),
            appointments = engine.appointment_index.len(),
            "engine ready"
        );
        Ok(engine)
    }

    /// Replay runs before the engine is shared, so every lock is free and
    /// `try_write` cannot fail. Never block here: partitions are opened
    /// lazily from inside the runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::EstablishmentCreated {
                id,
                name,
                owner_id,
                utc_offset_minutes,
            } => {
                let info = Establishment {
                    id: *id,
                    name: name.clone(),
                    owner_id: *owner_id,
                    utc_offset_minutes: *utc_offset_minutes,
                };
                self.establishments
                    .insert(*id, Arc::new(RwLock::new(EstablishmentState::new(info))));
            }
            Event::AppointmentBooked { id, scope, .. } => {
                // A write reported as failed may have reached the disk
                // before its retry did; the first copy wins.
                if self.appointment_index.contains_key(id) {
                    tracing::warn!(appointment = %id, "duplicate booking in WAL skipped");
                    return;
                }
                let ledger = self.ledger(*scope);
                if let Ok(mut guard) = ledger.try_write() {
                    apply_to_ledger(&mut guard, event);
                    self.appointment_index.insert(*id, *scope);
                }
            }
            Event::AppointmentCancelled { scope, .. } => {
                if let Some(ledger) = self.get_ledger(scope)
                    && let Ok(mut guard) = ledger.try_write()
                {
                    apply_to_ledger(&mut guard, event);
                }
            }
            catalog => {
                let Some(est_id) = catalog_establishment_id(catalog) else {
                    return;
                };
                if let Some(est) = self.get_establishment(&est_id)
                    && let Ok(mut guard) = est.try_write()
                {
                    apply_to_establishment(&mut guard, catalog);
                    self.index_catalog(catalog);
                }
            }
        }
    }

    pub(super) fn index_catalog(&self, event: &Event) {
        match event {
            Event::StaffAdded {
                id,
                establishment_id,
                ..
            }
            | Event::ServiceCreated {
                id,
                establishment_id,
                ..
            }
            | Event::WindowAdded {
                id,
                establishment_id,
                ..
            } => {
                self.catalog_index.insert(*id, *establishment_id);
            }
            Event::ServiceRemoved { id, .. } | Event::WindowRemoved { id, .. } => {
                self.catalog_index.remove(id);
            }
            _ => {}
        }
    }

    /// Persist a catalog event and apply it under the establishment lock.
    pub(super) async fn persist_catalog(
        &self,
        est: &mut EstablishmentState,
        event: Event,
    ) -> Result<(), EngineError> {
        wal_append(&self.wal_tx, event.clone()).await?;
        apply_to_establishment(est, &event);
        self.index_catalog(&event);
        Ok(())
    }

    pub fn get_establishment(&self, id: &Ulid) -> Option<SharedEstablishment> {
        self.establishments.get(id).map(|e| e.value().clone())
    }

    /// Owning establishment of a staff member, service or window.
    pub fn establishment_of(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.catalog_index.get(entity_id).map(|e| *e.value())
    }

    pub fn get_ledger(&self, scope: &ResourceScope) -> Option<SharedLedger> {
        self.ledgers.get(scope).map(|e| e.value().clone())
    }

    /// Ledger for `scope`, created empty on first use.
    pub(super) fn ledger(&self, scope: ResourceScope) -> SharedLedger {
        self.ledgers
            .entry(scope)
            .or_insert_with(|| Arc::new(RwLock::new(Ledger::new(scope))))
            .clone()
    }

    pub(super) fn require_establishment(&self, id: Ulid) -> Result<SharedEstablishment, EngineError> {
        self.get_establishment(&id).ok_or(EngineError::NotFound(id))
    }

    /// `now` on the wall clock of `establishment_id`; unchanged if unknown.
    pub(super) async fn local_time(&self, establishment_id: Ulid, now: Ms) -> Ms {
        match self.get_establishment(&establishment_id) {
            Some(est) => est.read().await.info.local_time(now),
            None => now,
        }
    }
}

/// Establishment a catalog event belongs to. Appointment and creation
/// events are routed elsewhere.
fn catalog_establishment_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::StaffAdded {
            establishment_id, ..
        }
        | Event::ServiceCreated {
            establishment_id, ..
        }
        | Event::ServiceRemoved {
            establishment_id, ..
        }
        | Event::ServiceAssigned {
            establishment_id, ..
        }
        | Event::WindowAdded {
            establishment_id, ..
        }
        | Event::WindowRemoved {
            establishment_id, ..
        } => Some(*establishment_id),
        Event::EstablishmentCreated { .. }
        | Event::AppointmentBooked { .. }
        | Event::AppointmentCancelled { .. } => None,
    }
}
