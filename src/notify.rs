use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{Appointment, AppointmentStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoticeKind {
    Booked,
    StatusChanged {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    Cancelled {
        reason: Option<String>,
    },
}

/// Something worth telling the parties of an appointment about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    #[serde(flatten)]
    pub kind: NoticeKind,
    pub appointment: Appointment,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notice encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Outbound channel for notices (email, push, ...). Delivery is best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notice: &Notice) -> Result<(), NotifyError>;
}

/// Logs each notice as one JSON line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn deliver(&self, notice: &Notice) -> Result<(), NotifyError> {
        let body = serde_json::to_string(notice)?;
        info!(target: "slotkeeper::notice", "{body}");
        Ok(())
    }
}

/// Fire and forget. A failed delivery is logged and never reaches the caller.
pub fn dispatch(notifier: Arc<dyn Notifier>, notice: Notice) {
    tokio::spawn(async move {
        if let Err(e) = notifier.deliver(&notice).await {
            warn!("notice for appointment {} not delivered: {e}", notice.appointment.id);
        }
    });
}
