use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, wal_append};

/// Everything an establishment owns except its appointments.
#[derive(Debug, Clone)]
pub struct EstablishmentState {
    pub info: Establishment,
    pub rules: RuleSet,
    pub services: HashMap<Ulid, Service>,
    pub staff: HashMap<Ulid, StaffMember>,
}

impl EstablishmentState {
    pub fn new(info: Establishment) -> Self {
        Self {
            info,
            rules: RuleSet::default(),
            services: HashMap::new(),
            staff: HashMap::new(),
        }
    }

    pub fn service(&self, id: Ulid) -> Result<&Service, EngineError> {
        self.services.get(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn staff_member(&self, id: Ulid) -> Result<&StaffMember, EngineError> {
        self.staff.get(&id).ok_or(EngineError::NotFound(id))
    }

    /// The service to book into `staff_id`'s scope (or the establishment's
    /// own scope when `None`). A staff member must be assigned to it.
    pub fn bookable_service(
        &self,
        service_id: Ulid,
        staff_id: Option<Ulid>,
    ) -> Result<&Service, EngineError> {
        let service = self.service(service_id)?;
        if let Some(staff_id) = staff_id {
            let member = self.staff_member(staff_id)?;
            if !member.services.contains(&service_id) {
                return Err(EngineError::NotAssigned {
                    staff_id,
                    service_id,
                });
            }
        }
        Ok(service)
    }
}

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    /// `utc_offset_minutes` fixes the wall clock the establishment's windows
    /// and appointments are read on.
    pub async fn create_establishment(
        &self,
        id: Ulid,
        name: String,
        owner_id: Ulid,
        utc_offset_minutes: i16,
    ) -> Result<(), EngineError> {
        check_name(&name, "establishment name too long")?;
        if !(-MAX_UTC_OFFSET_MINUTES..=MAX_UTC_OFFSET_MINUTES).contains(&utc_offset_minutes) {
            return Err(EngineError::InvalidRange("utc offset beyond 14 hours"));
        }
        if self.establishments.len() >= MAX_ESTABLISHMENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many establishments"));
        }
        let _gate = self.commit_gate.read().await;
        if self.establishments.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::EstablishmentCreated {
            id,
            name: name.clone(),
            owner_id,
            utc_offset_minutes,
        };
        wal_append(&self.wal_tx, event).await?;
        let info = Establishment {
            id,
            name,
            owner_id,
            utc_offset_minutes,
        };
        self.establishments
            .insert(id, Arc::new(RwLock::new(EstablishmentState::new(info))));
        tracing::info!(establishment = %id, utc_offset_minutes, "establishment created");
        Ok(())
    }

    pub async fn add_staff(
        &self,
        id: Ulid,
        establishment_id: Ulid,
        name: String,
    ) -> Result<(), EngineError> {
        check_name(&name, "staff name too long")?;
        let _gate = self.commit_gate.read().await;
        let est = self.require_establishment(establishment_id)?;
        let mut guard = est.write().await;
        if guard.staff.len() >= MAX_STAFF_PER_ESTABLISHMENT {
            return Err(EngineError::LimitExceeded("too many staff members"));
        }
        if self.catalog_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::StaffAdded {
            id,
            establishment_id,
            name,
        };
        self.persist_catalog(&mut guard, event).await
    }

    pub async fn assign_service(&self, staff_id: Ulid, service_id: Ulid) -> Result<(), EngineError> {
        let establishment_id = self
            .establishment_of(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let _gate = self.commit_gate.read().await;
        let est = self.require_establishment(establishment_id)?;
        let mut guard = est.write().await;
        let member = guard.staff_member(staff_id)?;
        // A service of another establishment is unknown here.
        guard.service(service_id)?;
        if member.services.contains(&service_id) {
            return Err(EngineError::AlreadyExists(service_id));
        }

        let event = Event::ServiceAssigned {
            establishment_id,
            staff_id,
            service_id,
        };
        self.persist_catalog(&mut guard, event).await
    }

    pub async fn create_service(
        &self,
        id: Ulid,
        establishment_id: Ulid,
        name: String,
        duration_minutes: u32,
        price_minor_units: u64,
    ) -> Result<(), EngineError> {
        check_name(&name, "service name too long")?;
        if duration_minutes == 0 || duration_minutes > MAX_SERVICE_DURATION_MINUTES {
            return Err(EngineError::InvalidRange(
                "duration must be between 1 and 1440 minutes",
            ));
        }
        let _gate = self.commit_gate.read().await;
        let est = self.require_establishment(establishment_id)?;
        let mut guard = est.write().await;
        if guard.services.len() >= MAX_SERVICES_PER_ESTABLISHMENT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if self.catalog_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ServiceCreated {
            id,
            establishment_id,
            name,
            duration_minutes,
            price_minor_units,
        };
        self.persist_catalog(&mut guard, event).await
    }

    /// Remove a service from the catalog. Appointments already booked for
    /// it are kept; staff assignments to it are dropped.
    pub async fn remove_service(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let establishment_id = self.establishment_of(&id).ok_or(EngineError::NotFound(id))?;
        let _gate = self.commit_gate.read().await;
        let est = self.require_establishment(establishment_id)?;
        let mut guard = est.write().await;
        guard.service(id)?;

        let event = Event::ServiceRemoved {
            id,
            establishment_id,
        };
        self.persist_catalog(&mut guard, event).await?;
        Ok(establishment_id)
    }

    /// Add a weekly opening window. Windows on the same day may overlap;
    /// slot generation emits each start once.
    pub async fn add_window(
        &self,
        id: Ulid,
        establishment_id: Ulid,
        day_of_week: u8,
        start: TimeOfDay,
        end: TimeOfDay,
    ) -> Result<(), EngineError> {
        if day_of_week > 6 {
            return Err(EngineError::InvalidRange("day_of_week must be 0 (Sunday) to 6"));
        }
        if start >= end {
            return Err(EngineError::InvalidRange("window start must be before end"));
        }
        let _gate = self.commit_gate.read().await;
        let est = self.require_establishment(establishment_id)?;
        let mut guard = est.write().await;
        if guard.rules.len() >= MAX_WINDOWS_PER_ESTABLISHMENT {
            return Err(EngineError::LimitExceeded("too many availability windows"));
        }
        if self.catalog_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::WindowAdded {
            id,
            establishment_id,
            day_of_week,
            start,
            end,
        };
        self.persist_catalog(&mut guard, event).await
    }

    pub async fn remove_window(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let establishment_id = self.establishment_of(&id).ok_or(EngineError::NotFound(id))?;
        let _gate = self.commit_gate.read().await;
        let est = self.require_establishment(establishment_id)?;
        let mut guard = est.write().await;
        if !guard.rules.iter().any(|w| w.id == id) {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::WindowRemoved {
            id,
            establishment_id,
        };
        self.persist_catalog(&mut guard, event).await?;
        Ok(establishment_id)
    }
}
