mod appointments;
mod booking;
pub mod conflict;
mod error;
mod lifecycle;
mod slots;
#[cfg(test)]
mod tests;

pub use appointments::AppointmentFilter;
pub use error::{ConflictReason, EngineError, ErrorKind};
pub use lifecycle::{allowed_transition, can_transition};
pub use slots::SlotPager;

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::{self, Notice, NoticeKind, Notifier, TracingNotifier};
use crate::store::ScheduleStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerPolicy {
    /// Put a cancelled appointment's slot back to Open.
    pub reopen_slot_on_cancel: bool,
}

/// Entry point for every slot and appointment operation.
///
/// Checks identity and transition rules, then delegates to the [`ScheduleStore`], whose
/// conditional writes have the final word on conflicts.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    policy: SchedulerPolicy,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(TracingNotifier),
            policy: SchedulerPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_policy(mut self, policy: SchedulerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> SchedulerPolicy {
        self.policy
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    fn notify(&self, kind: NoticeKind, appointment: &Appointment) {
        notify::dispatch(
            self.notifier.clone(),
            Notice {
                kind,
                appointment: appointment.clone(),
            },
        );
    }
}
