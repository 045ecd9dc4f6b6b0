use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    CANCELLATIONS_TOTAL, COMMIT_TIMEOUTS_TOTAL, RESERVATION_CONFLICTS_TOTAL,
    RESERVATIONS_COMMITTED_TOTAL, STORAGE_RETRIES_TOTAL,
};

use super::conflict::{check_no_conflict, validate_span};
use super::{
    apply_to_ledger, wal_append, Engine, EngineError, EstablishmentState, SharedEstablishment,
    SharedLedger, WalCommand,
};

/// A client's choice of slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveRequest {
    /// Caller-chosen appointment id.
    pub id: Ulid,
    pub establishment_id: Ulid,
    pub service_id: Ulid,
    /// `None` books the establishment-wide scope.
    pub staff_id: Option<Ulid>,
    pub client_id: Ulid,
    pub start: Ms,
}

impl ReserveRequest {
    pub fn scope(&self) -> ResourceScope {
        ResourceScope::new(self.establishment_id, self.staff_id)
    }
}

/// Everything one reservation attempt needs, owned so it can run detached.
struct ReservationCommit {
    request: ReserveRequest,
    now: Ms,
    grace_ms: Ms,
    establishment: SharedEstablishment,
    ledger: SharedLedger,
    appointment_index: Arc<DashMap<Ulid, ResourceScope>>,
    wal_tx: mpsc::Sender<WalCommand>,
    gate: Arc<RwLock<()>>,
}

/// The span a request would occupy, if the catalog allows it. `local_now`
/// is on the establishment's wall clock.
fn requested_span(
    est: &EstablishmentState,
    req: &ReserveRequest,
    local_now: Ms,
    grace_ms: Ms,
) -> Result<Span, EngineError> {
    let service = est.bookable_service(req.service_id, req.staff_id)?;
    let end = req
        .start
        .checked_add(service.duration_ms())
        .ok_or(EngineError::InvalidRange("start out of range"))?;
    let span = Span {
        start: req.start,
        end,
    };
    validate_span(&span)?;
    if span.start < local_now.saturating_sub(grace_ms) {
        return Err(EngineError::InvalidRange("start is in the past"));
    }

    let date = date_of(span.start).ok_or(EngineError::InvalidRange("start out of range"))?;
    if !est.rules.windows_on(date).iter().any(|w| w.contains(&span)) {
        return Err(EngineError::OutsideOpeningHours(span));
    }
    Ok(span)
}

impl ReservationCommit {
    /// Check-then-insert under the scope's write lock. Runs to completion
    /// even when the caller has gone away.
    async fn run(self) -> Result<AppointmentInfo, EngineError> {
        let req = self.request;
        let scope = req.scope();
        let _gate = self.gate.read_owned().await;
        let est = self.establishment.read().await;
        let local_now = est.info.local_time(self.now);
        let span = requested_span(&est, &req, local_now, self.grace_ms)?;

        let mut ledger = self.ledger.write().await;
        if ledger.appointments.len() >= MAX_APPOINTMENTS_PER_SCOPE {
            return Err(EngineError::LimitExceeded("too many appointments in scope"));
        }
        check_no_conflict(&ledger, &span)?;

        match self.appointment_index.entry(req.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(req.id)),
            Entry::Vacant(slot) => {
                slot.insert(scope);
            }
        }

        let event = Event::AppointmentBooked {
            id: req.id,
            scope,
            service_id: req.service_id,
            client_id: req.client_id,
            span,
            created_at: self.now,
        };
        if let Err(e) = wal_append(&self.wal_tx, event.clone()).await {
            self.appointment_index.remove(&req.id);
            return Err(e);
        }
        apply_to_ledger(&mut ledger, &event);

        ledger
            .get(req.id)
            .map(|a| AppointmentInfo::at(a, local_now))
            .ok_or(EngineError::NotFound(req.id))
    }
}

impl Engine {
    /// Book `req` if its interval is still free in its scope. `now` is the
    /// current UTC instant.
    ///
    /// Storage failures are retried up to `commit_attempts` times; a
    /// conflict or validation error is returned as-is. A commit that outlives
    /// `commit_timeout` reports `CommitTimeout` and may still land.
    pub async fn reserve(&self, req: ReserveRequest, now: Ms) -> Result<AppointmentInfo, EngineError> {
        let attempts = self.config.commit_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.reserve_once(req, now).await {
                Err(EngineError::Storage(e)) if attempt < attempts => {
                    tracing::warn!(
                        appointment = %req.id,
                        attempt,
                        "storage error during reservation, retrying: {e}"
                    );
                    metrics::counter!(STORAGE_RETRIES_TOTAL).increment(1);
                    tokio::time::sleep(Duration::from_millis(
                        STORAGE_RETRY_BACKOFF_MS * u64::from(attempt),
                    ))
                    .await;
                    attempt += 1;
                }
                Ok(info) => {
                    metrics::counter!(RESERVATIONS_COMMITTED_TOTAL).increment(1);
                    tracing::info!(
                        appointment = %info.id,
                        establishment = %info.establishment_id,
                        start = info.start,
                        end = info.end,
                        "appointment booked"
                    );
                    return Ok(info);
                }
                Err(e) => {
                    if let EngineError::Conflict(existing) = &e {
                        metrics::counter!(RESERVATION_CONFLICTS_TOTAL).increment(1);
                        tracing::debug!(appointment = %req.id, %existing, "reservation lost to existing appointment");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn reserve_once(&self, req: ReserveRequest, now: Ms) -> Result<AppointmentInfo, EngineError> {
        let establishment = self.require_establishment(req.establishment_id)?;
        // Unknown staff must not leave an empty ledger behind.
        establishment
            .read()
            .await
            .bookable_service(req.service_id, req.staff_id)?;
        let commit = ReservationCommit {
            request: req,
            now,
            grace_ms: self.config.booking_grace_ms,
            establishment,
            ledger: self.ledger(req.scope()),
            appointment_index: self.appointment_index.clone(),
            wal_tx: self.wal_tx.clone(),
            gate: self.commit_gate.clone(),
        };
        self.run_commit(commit.run()).await
    }

    /// Cancel a confirmed appointment on behalf of `actor_id`.
    pub async fn cancel(
        &self,
        appointment_id: Ulid,
        actor_id: Ulid,
        now: Ms,
    ) -> Result<AppointmentInfo, EngineError> {
        let scope = self
            .appointment_index
            .get(&appointment_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(appointment_id))?;
        let establishment = self.require_establishment(scope.establishment_id)?;
        let ledger = self
            .get_ledger(&scope)
            .ok_or(EngineError::NotFound(appointment_id))?;
        let policy = self.config.cancellation.clone();
        let wal_tx = self.wal_tx.clone();
        let gate = self.commit_gate.clone();

        let info = self
            .run_commit(async move {
                let _gate = gate.read_owned().await;
                let (owner_id, local_now) = {
                    let est = establishment.read().await;
                    (est.info.owner_id, est.info.local_time(now))
                };
                let mut ledger = ledger.write().await;
                let appointment = ledger
                    .get(appointment_id)
                    .ok_or(EngineError::NotFound(appointment_id))?;
                let status = appointment.status_at(local_now);
                if status != AppointmentStatus::Confirmed {
                    return Err(EngineError::InvalidTransition {
                        appointment_id,
                        status,
                    });
                }
                if !policy.permits(actor_id, owner_id, appointment, local_now) {
                    return Err(EngineError::Forbidden {
                        actor_id,
                        appointment_id,
                    });
                }

                let event = Event::AppointmentCancelled {
                    id: appointment_id,
                    scope,
                    actor_id,
                    at: now,
                };
                wal_append(&wal_tx, event.clone()).await?;
                apply_to_ledger(&mut ledger, &event);
                ledger
                    .get(appointment_id)
                    .map(|a| AppointmentInfo::at(a, local_now))
                    .ok_or(EngineError::NotFound(appointment_id))
            })
            .await?;

        metrics::counter!(CANCELLATIONS_TOTAL).increment(1);
        tracing::info!(appointment = %appointment_id, actor = %actor_id, "appointment cancelled");
        Ok(info)
    }

    /// Run a persist-and-apply section on its own task, bounded by the
    /// commit timeout. Dropping the caller does not abort the section.
    async fn run_commit<T, F>(&self, section: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let handle = tokio::spawn(section);
        match tokio::time::timeout(self.config.commit_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(EngineError::Storage(format!("commit task failed: {join_err}"))),
            Err(_) => {
                metrics::counter!(COMMIT_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!(
                    timeout_ms = self.config.commit_timeout.as_millis() as u64,
                    "commit timed out"
                );
                Err(EngineError::CommitTimeout)
            }
        }
    }

    /// Rewrite the WAL as the minimal event sequence that rebuilds the
    /// current state: catalog first, then every appointment followed by its
    /// cancellation, if any.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let establishments: Vec<SharedEstablishment> =
            self.establishments.iter().map(|e| e.value().clone()).collect();
        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();

        let mut events = Vec::new();
        for est in establishments {
            let est = est.read().await;
            emit_catalog(&est, &mut events);
        }
        for ledger in ledgers {
            let ledger = ledger.read().await;
            for a in &ledger.appointments {
                events.push(Event::AppointmentBooked {
                    id: a.id,
                    scope: a.scope,
                    service_id: a.service_id,
                    client_id: a.client_id,
                    span: a.span,
                    created_at: a.created_at,
                });
                if let Some(c) = a.cancellation {
                    events.push(Event::AppointmentCancelled {
                        id: a.id,
                        scope: a.scope,
                        actor_id: c.actor_id,
                        at: c.at,
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
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

fn emit_catalog(est: &EstablishmentState, events: &mut Vec<Event>) {
    let establishment_id = est.info.id;
    events.push(Event::EstablishmentCreated {
        id: establishment_id,
        name: est.info.name.clone(),
        owner_id: est.info.owner_id,
        utc_offset_minutes: est.info.utc_offset_minutes,
    });
    for service in est.services.values() {
        events.push(Event::ServiceCreated {
            id: service.id,
            establishment_id,
            name: service.name.clone(),
            duration_minutes: service.duration_minutes,
            price_minor_units: service.price_minor_units,
        });
    }
    for member in est.staff.values() {
        events.push(Event::StaffAdded {
            id: member.id,
            establishment_id,
            name: member.name.clone(),
        });
        for &service_id in &member.services {
            events.push(Event::ServiceAssigned {
                establishment_id,
                staff_id: member.id,
                service_id,
            });
        }
    }
    for w in est.rules.iter() {
        events.push(Event::WindowAdded {
            id: w.id,
            establishment_id,
            day_of_week: w.day_of_week,
            start: w.start,
            end: w.end,
        });
    }
}
