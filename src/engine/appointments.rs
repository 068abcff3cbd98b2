use crate::limits::*;
use crate::model::*;

use super::{EngineError, Scheduler};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppointmentFilter {
    pub provider_id: Option<UserId>,
    pub requester_id: Option<UserId>,
    pub status: Option<AppointmentStatus>,
}

impl AppointmentFilter {
    fn matches(&self, appt: &Appointment) -> bool {
        self.provider_id.is_none_or(|p| appt.provider_id == p)
            && self.requester_id.is_none_or(|r| appt.requester_id == r)
            && self.status.is_none_or(|s| appt.status == s)
    }
}

impl Scheduler {
    pub async fn get_appointment(
        &self,
        id: AppointmentId,
        actor: &Actor,
    ) -> Result<Appointment, EngineError> {
        let appt = self
            .store
            .get_appointment(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if actor.is_admin() || appt.involves(actor.id) {
            Ok(appt)
        } else {
            Err(EngineError::Unauthorized(format!(
                "{actor} is not a party to appointment {id}"
            )))
        }
    }

    /// Appointments visible to `actor` that match `filter`, by start ascending.
    /// Providers and requesters only ever see their own side.
    pub async fn list_appointments(
        &self,
        actor: &Actor,
        filter: AppointmentFilter,
    ) -> Result<Vec<Appointment>, EngineError> {
        let scoped = match actor.role {
            Role::Provider => {
                if filter.provider_id.is_some_and(|p| p != actor.id) {
                    return Err(EngineError::Unauthorized(format!(
                        "{actor} cannot list another provider's appointments"
                    )));
                }
                self.store.list_appointments_by_provider(actor.id).await?
            }
            Role::Requester => {
                if filter.requester_id.is_some_and(|r| r != actor.id) {
                    return Err(EngineError::Unauthorized(format!(
                        "{actor} cannot list another requester's appointments"
                    )));
                }
                self.store.list_appointments_by_requester(actor.id).await?
            }
            Role::Admin => match (filter.provider_id, filter.requester_id) {
                (Some(p), _) => self.store.list_appointments_by_provider(p).await?,
                (None, Some(r)) => self.store.list_appointments_by_requester(r).await?,
                (None, None) => self.store.list_all_appointments().await?,
            },
        };
        Ok(scoped.into_iter().filter(|a| filter.matches(a)).collect())
    }

    /// Per-status totals over the actor's appointments. Admins count everything.
    pub async fn appointment_counts(&self, actor: &Actor) -> Result<StatusCounts, EngineError> {
        let mut counts = StatusCounts::default();
        for appt in self.list_appointments(actor, AppointmentFilter::default()).await? {
            counts.record(appt.status);
        }
        Ok(counts)
    }

    /// Active appointments starting at or after now, soonest first.
    pub async fn upcoming_appointments(
        &self,
        actor: &Actor,
        limit: usize,
    ) -> Result<Vec<Appointment>, EngineError> {
        let limit = match limit {
            0 => DEFAULT_UPCOMING_LIMIT,
            n => n.min(MAX_PAGE_SIZE),
        };
        let now = self.now();
        Ok(self
            .list_appointments(actor, AppointmentFilter::default())
            .await?
            .into_iter()
            .filter(|a| a.status.is_active() && a.range.start >= now)
            .take(limit)
            .collect())
    }

    /// Everything a provider has, read under one lock.
    pub async fn snapshot(&self, provider_id: UserId) -> Result<ProviderSnapshot, EngineError> {
        let state = self.store.provider_state(provider_id).await?;
        Ok(ProviderSnapshot {
            provider_id,
            slots: state.slots,
            appointments: state.appointments,
            taken_at: self.now(),
        })
    }
}
