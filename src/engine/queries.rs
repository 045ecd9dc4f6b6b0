use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::SLOT_GRANULARITY_MS;
use crate::model::*;

use super::slots::generate_slots;
use super::{Engine, EngineError, SharedLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotQuery {
    pub establishment_id: Ulid,
    pub service_id: Ulid,
    /// `None` asks for the establishment-wide scope.
    pub staff_id: Option<Ulid>,
    pub date: NaiveDate,
}

impl Engine {
    /// Bookable slots for one service on one date, earliest first.
    ///
    /// A point-in-time projection: only shared locks are taken, and the
    /// answer may be stale by the time the client reserves. Starts before
    /// `now` (UTC, shifted onto the establishment's clock) are left out.
    pub async fn available_slots(&self, query: &SlotQuery, now: Ms) -> Result<Vec<Span>, EngineError> {
        let est = self.require_establishment(query.establishment_id)?;
        let (open, duration, local_now) = {
            let guard = est.read().await;
            let service = guard.bookable_service(query.service_id, query.staff_id)?;
            (
                guard.rules.windows_on(query.date),
                service.duration_ms(),
                guard.info.local_time(now),
            )
        };
        if open.is_empty() {
            return Ok(Vec::new());
        }

        let scope = ResourceScope::new(query.establishment_id, query.staff_id);
        let busy = self.busy_on(&scope, query.date).await;
        Ok(generate_slots(&open, &busy, duration, SLOT_GRANULARITY_MS, local_now))
    }

    /// Raw free time of a scope on `date`: open windows minus busy intervals.
    pub async fn free_spans(
        &self,
        establishment_id: Ulid,
        staff_id: Option<Ulid>,
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        let est = self.require_establishment(establishment_id)?;
        let open = {
            let guard = est.read().await;
            if let Some(staff_id) = staff_id {
                guard.staff_member(staff_id)?;
            }
            guard.rules.windows_on(date)
        };
        let busy = self.busy_on(&ResourceScope::new(establishment_id, staff_id), date).await;
        Ok(super::availability::free_spans(&open, &busy))
    }

    /// Spans of non-cancelled appointments touching `date`, including ones
    /// that started the day before.
    async fn busy_on(&self, scope: &ResourceScope, date: NaiveDate) -> Vec<Span> {
        let Some(ledger) = self.get_ledger(scope) else {
            return Vec::new();
        };
        let guard = ledger.read().await;
        guard.busy(&day_span(date)).map(|a| a.span).collect()
    }

    pub async fn appointment(&self, id: Ulid, now: Ms) -> Result<AppointmentInfo, EngineError> {
        let scope = self
            .appointment_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let ledger = self.get_ledger(&scope).ok_or(EngineError::NotFound(id))?;
        let local_now = self.local_time(scope.establishment_id, now).await;
        let guard = ledger.read().await;
        guard
            .get(id)
            .map(|a| AppointmentInfo::at(a, local_now))
            .ok_or(EngineError::NotFound(id))
    }

    /// Every appointment of an establishment across all its scopes, any
    /// status, optionally limited to those touching `date`.
    pub async fn appointments_for_establishment(
        &self,
        establishment_id: Ulid,
        date: Option<NaiveDate>,
        now: Ms,
    ) -> Result<Vec<AppointmentInfo>, EngineError> {
        let local_now = self
            .require_establishment(establishment_id)?
            .read()
            .await
            .info
            .local_time(now);
        let ledgers = self.ledgers_where(|scope| scope.establishment_id == establishment_id);

        let mut result = Vec::new();
        for (_, ledger) in ledgers {
            let guard = ledger.read().await;
            match date {
                Some(d) => result.extend(
                    guard
                        .overlapping(&day_span(d))
                        .map(|a| AppointmentInfo::at(a, local_now)),
                ),
                None => result.extend(
                    guard
                        .appointments
                        .iter()
                        .map(|a| AppointmentInfo::at(a, local_now)),
                ),
            }
        }
        sort_appointments(&mut result);
        Ok(result)
    }

    pub async fn appointments_for_client(&self, client_id: Ulid, now: Ms) -> Vec<AppointmentInfo> {
        let mut result = Vec::new();
        for (scope, ledger) in self.ledgers_where(|_| true) {
            // Establishment before ledger, the order reservations lock in.
            let local_now = self.local_time(scope.establishment_id, now).await;
            let guard = ledger.read().await;
            result.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| a.client_id == client_id)
                    .map(|a| AppointmentInfo::at(a, local_now)),
            );
        }
        sort_appointments(&mut result);
        result
    }

    pub async fn list_establishments(&self) -> Vec<Establishment> {
        let all: Vec<_> = self.establishments.iter().map(|e| e.value().clone()).collect();
        let mut result = Vec::with_capacity(all.len());
        for est in all {
            result.push(est.read().await.info.clone());
        }
        result.sort_by_key(|e| e.id);
        result
    }

    pub async fn windows(&self, establishment_id: Ulid) -> Result<Vec<AvailabilityWindow>, EngineError> {
        let est = self.require_establishment(establishment_id)?;
        let guard = est.read().await;
        Ok(guard.rules.iter().cloned().collect())
    }

    pub async fn services(&self, establishment_id: Ulid) -> Result<Vec<Service>, EngineError> {
        let est = self.require_establishment(establishment_id)?;
        let guard = est.read().await;
        let mut services: Vec<Service> = guard.services.values().cloned().collect();
        services.sort_by_key(|s| s.id);
        Ok(services)
    }

    pub async fn staff(&self, establishment_id: Ulid) -> Result<Vec<StaffMember>, EngineError> {
        let est = self.require_establishment(establishment_id)?;
        let guard = est.read().await;
        let mut staff: Vec<StaffMember> = guard.staff.values().cloned().collect();
        staff.sort_by_key(|s| s.id);
        Ok(staff)
    }

    /// Snapshot the matching ledger handles so no map shard stays locked
    /// across an await.
    fn ledgers_where(
        &self,
        pred: impl Fn(&ResourceScope) -> bool,
    ) -> Vec<(ResourceScope, SharedLedger)> {
        self.ledgers
            .iter()
            .filter(|e| pred(e.key()))
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }
}

fn sort_appointments(list: &mut [AppointmentInfo]) {
    list.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
}
