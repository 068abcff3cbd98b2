use std::sync::Arc;

use futures::stream::{self, Stream, TryStreamExt};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::ScheduleStore;

use super::conflict::validate_range;
use super::{EngineError, Scheduler};

/// Window `[from, to)` with open ends mapped to the extremes of `Ms`.
fn window(from: Option<Ms>, to: Option<Ms>) -> Result<TimeRange, EngineError> {
    let start = from.unwrap_or(Ms::MIN);
    let end = to.unwrap_or(Ms::MAX);
    TimeRange::try_new(start, end).ok_or(EngineError::InvalidRange {
        range: TimeRange { start, end },
        reason: "window start must be before end",
    })
}

fn check_owner(actor: &Actor, provider_id: UserId) -> Result<(), EngineError> {
    if actor.is_admin() || (actor.role == Role::Provider && actor.id == provider_id) {
        return Ok(());
    }
    Err(EngineError::Unauthorized(format!(
        "{actor} cannot manage slots of provider {provider_id}"
    )))
}

impl Scheduler {
    pub async fn add_slot(
        &self,
        actor: &Actor,
        provider_id: UserId,
        range: TimeRange,
    ) -> Result<Slot, EngineError> {
        self.add_slot_with_id(Ulid::new(), actor, provider_id, range).await
    }

    pub async fn add_slot_with_id(
        &self,
        id: SlotId,
        actor: &Actor,
        provider_id: UserId,
        range: TimeRange,
    ) -> Result<Slot, EngineError> {
        validate_range(&range, self.now())?;
        check_owner(actor, provider_id)?;

        let slot = self
            .store
            .insert_slot_if_no_conflict(id, provider_id, range)
            .await?;
        info!("slot {} {} opened by {actor}", slot.id, slot.range);
        Ok(slot)
    }

    /// Slots of `provider_id` overlapping `[from, to)`, by start then insertion order.
    pub async fn list_slots(
        &self,
        provider_id: UserId,
        from: Option<Ms>,
        to: Option<Ms>,
    ) -> Result<Vec<Slot>, EngineError> {
        let window = window(from, to)?;
        self.store.list_slots_by_provider(provider_id, window).await
    }

    pub fn slot_pager(
        &self,
        provider_id: UserId,
        from: Option<Ms>,
        to: Option<Ms>,
        page_size: usize,
    ) -> Result<SlotPager, EngineError> {
        Ok(SlotPager {
            store: self.store.clone(),
            provider_id,
            window: window(from, to)?,
            page_size: match page_size {
                0 => DEFAULT_PAGE_SIZE,
                n => n.min(MAX_PAGE_SIZE),
            },
            cursor: None,
            exhausted: false,
        })
    }

    pub async fn remove_slot(&self, slot_id: SlotId, actor: &Actor) -> Result<Slot, EngineError> {
        let slot = self
            .store
            .get_slot(slot_id)
            .await?
            .ok_or(EngineError::NotFound(slot_id))?;
        check_owner(actor, slot.provider_id)?;
        if !slot.is_open() {
            return Err(EngineError::State(format!("slot {slot_id} is claimed")));
        }

        let removed = self.store.remove_slot_if_open(slot_id).await?;
        info!("slot {slot_id} removed by {actor}");
        Ok(removed)
    }
}

/// Lazily pages through a provider's slots. Each page is a fresh read, so slots added
/// behind the cursor are not seen until [`SlotPager::rewind`].
pub struct SlotPager {
    store: Arc<dyn ScheduleStore>,
    provider_id: UserId,
    window: TimeRange,
    page_size: usize,
    cursor: Option<SlotCursor>,
    exhausted: bool,
}

impl SlotPager {
    /// The next page, or `None` once the window is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Slot>>, EngineError> {
        if self.exhausted {
            return Ok(None);
        }

        // Anything past the cursor starts at or after cursor.start, so the read can begin there.
        let read_from = match self.cursor {
            Some(c) => c.start.max(self.window.start),
            None => self.window.start,
        };
        let Some(read_window) = TimeRange::try_new(read_from, self.window.end) else {
            self.exhausted = true;
            return Ok(None);
        };

        let slots = self
            .store
            .list_slots_by_provider(self.provider_id, read_window)
            .await?;
        let page: Vec<Slot> = slots
            .into_iter()
            .filter(|s| self.cursor.is_none_or(|c| s.cursor() > c))
            .take(self.page_size)
            .collect();

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.cursor = Some(last.cursor());
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }

    pub fn rewind(&mut self) {
        self.cursor = None;
        self.exhausted = false;
    }

    /// Every remaining slot as a stream, fetched a page at a time.
    pub fn into_stream(self) -> impl Stream<Item = Result<Slot, EngineError>> {
        stream::try_unfold(self, |mut pager| async move {
            Ok::<_, EngineError>(pager.next_page().await?.map(|page| (page, pager)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<Slot, EngineError>)))
        .try_flatten()
    }
}
