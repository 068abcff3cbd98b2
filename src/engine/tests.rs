use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio_test::assert_ok;
use ulid::Ulid;

use super::*;
use crate::clock::ManualClock;
use crate::notify::testing::RecordingNotifier;
use crate::store::{ScheduleStore, StatusChange, WalStore};

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

/// 2025-01-10T08:00:00Z
const JAN_10_0800: Ms = 1_736_496_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotkeeper_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Fixture {
    scheduler: Arc<Scheduler>,
    clock: Arc<ManualClock>,
    notices: Arc<RecordingNotifier>,
    provider: Actor,
}

fn fixture_at(path: PathBuf, policy: SchedulerPolicy) -> Fixture {
    let store = Arc::new(WalStore::open(&path).unwrap());
    let clock = Arc::new(ManualClock::new(JAN_10_0800 - 24 * H));
    let notices = Arc::new(RecordingNotifier::default());
    let scheduler = Scheduler::new(store)
        .with_clock(clock.clone())
        .with_notifier(notices.clone())
        .with_policy(policy);
    Fixture {
        scheduler: Arc::new(scheduler),
        clock,
        notices,
        provider: Actor::provider(Ulid::new()),
    }
}

fn fixture(name: &str) -> Fixture {
    fixture_at(test_wal_path(name), SchedulerPolicy::default())
}

fn at(offset_hours: i64) -> TimeRange {
    TimeRange::new(JAN_10_0800 + offset_hours * H, JAN_10_0800 + (offset_hours + 1) * H)
}

/// Let spawned notice deliveries run.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// ── Slots ────────────────────────────────────────────────

#[tokio::test]
async fn add_and_list_slot() {
    let f = fixture("add_list.wal");
    let slot = f
        .scheduler
        .add_slot(&f.provider, f.provider.id, at(0))
        .await
        .unwrap();
    assert_eq!(slot.status, SlotStatus::Open);
    assert_eq!(slot.provider_id, f.provider.id);

    let listed = f.scheduler.list_slots(f.provider.id, None, None).await.unwrap();
    assert_eq!(listed, vec![slot]);
}

#[tokio::test]
async fn slot_in_the_past_is_rejected() {
    let f = fixture("past_slot.wal");
    let past = TimeRange::new(f.clock.now_ms() - 2 * H, f.clock.now_ms() - H);
    let err = f
        .scheduler
        .add_slot(&f.provider, f.provider.id, past)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(f.scheduler.list_slots(f.provider.id, None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn slot_starting_now_is_rejected() {
    let f = fixture("now_slot.wal");
    let now = f.clock.now_ms();
    let err = f
        .scheduler
        .add_slot(&f.provider, f.provider.id, TimeRange::new(now, now + H))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRange { reason: "starts in the past", .. }));
}

#[tokio::test]
async fn overlong_slot_is_rejected() {
    let f = fixture("long_slot.wal");
    let range = TimeRange::new(JAN_10_0800, JAN_10_0800 + 8 * 24 * H);
    let err = f
        .scheduler
        .add_slot(&f.provider, f.provider.id, range)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRange { reason: "slot too long", .. }));
}

#[tokio::test]
async fn overlapping_open_slot_is_rejected() {
    let f = fixture("overlap_open.wal");
    f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();

    let half_past = TimeRange::new(JAN_10_0800 + 30 * M, JAN_10_0800 + 90 * M);
    let err = f
        .scheduler
        .add_slot(&f.provider, f.provider.id, half_past)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ConflictReason::OverlapsSlot(_))));
}

#[tokio::test]
async fn slot_over_active_appointment_is_rejected() {
    let f = fixture("overlap_appt.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    let requester = Actor::requester(Ulid::new());
    f.scheduler.book(slot.id, &requester, "intake").await.unwrap();

    // The claimed slot is no longer Open, so only the appointment blocks this.
    let err = f
        .scheduler
        .add_slot(&f.provider, f.provider.id, at(0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ConflictReason::OverlapsAppointment(_))));
}

#[tokio::test]
async fn slot_over_cancelled_appointment_is_allowed() {
    let f = fixture("over_cancelled.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    let requester = Actor::requester(Ulid::new());
    let appt = f.scheduler.book(slot.id, &requester, "intake").await.unwrap();
    f.scheduler.cancel(appt.id, &requester, None).await.unwrap();

    assert_ok!(f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await);
}

#[tokio::test]
async fn adjacent_slots_do_not_conflict() {
    let f = fixture("adjacent.wal");
    f.scheduler.add_slot(&f.provider, f.provider.id, at(2)).await.unwrap();
    f.scheduler.add_slot(&f.provider, f.provider.id, at(3)).await.unwrap();
    f.scheduler.add_slot(&f.provider, f.provider.id, at(1)).await.unwrap();

    let starts: Vec<Ms> = f
        .scheduler
        .list_slots(f.provider.id, None, None)
        .await
        .unwrap()
        .iter()
        .map(|s| s.range.start)
        .collect();
    assert_eq!(starts, vec![at(1).start, at(2).start, at(3).start]);
}

#[tokio::test]
async fn other_providers_do_not_conflict() {
    let f = fixture("two_providers.wal");
    let other = Actor::provider(Ulid::new());
    f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    assert_ok!(f.scheduler.add_slot(&other, other.id, at(0)).await);
}

#[tokio::test]
async fn only_owner_or_admin_adds_slots() {
    let f = fixture("add_auth.wal");
    let stranger = Actor::provider(Ulid::new());
    let requester = Actor::requester(f.provider.id);

    for actor in [stranger, requester] {
        let err = f
            .scheduler
            .add_slot(&actor, f.provider.id, at(0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }
    assert_ok!(
        f.scheduler
            .add_slot(&Actor::admin(Ulid::new()), f.provider.id, at(0))
            .await
    );
}

#[tokio::test]
async fn listing_is_idempotent() {
    let f = fixture("idempotent.wal");
    for h in [5, 1, 3] {
        f.scheduler.add_slot(&f.provider, f.provider.id, at(h)).await.unwrap();
    }
    let first = f.scheduler.list_slots(f.provider.id, None, None).await.unwrap();
    let second = f.scheduler.list_slots(f.provider.id, None, None).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
}

#[tokio::test]
async fn list_window_uses_overlap() {
    let f = fixture("window.wal");
    for h in 0..4 {
        f.scheduler.add_slot(&f.provider, f.provider.id, at(h)).await.unwrap();
    }

    // [08:30, 10:00) touches the 08:00 and 09:00 slots only.
    let listed = f
        .scheduler
        .list_slots(
            f.provider.id,
            Some(JAN_10_0800 + 30 * M),
            Some(JAN_10_0800 + 2 * H),
        )
        .await
        .unwrap();
    assert_eq!(
        listed.iter().map(|s| s.range).collect::<Vec<_>>(),
        vec![at(0), at(1)]
    );

    let err = f
        .scheduler
        .list_slots(f.provider.id, Some(JAN_10_0800), Some(JAN_10_0800))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn list_includes_claimed_slots() {
    let f = fixture("list_claimed.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    f.scheduler
        .book(slot.id, &Actor::requester(Ulid::new()), "")
        .await
        .unwrap();

    let listed = f.scheduler.list_slots(f.provider.id, None, None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, SlotStatus::Claimed);
}

#[tokio::test]
async fn pager_walks_pages_and_rewinds() {
    let f = fixture("pager.wal");
    for h in 0..7 {
        f.scheduler.add_slot(&f.provider, f.provider.id, at(h)).await.unwrap();
    }

    let mut pager = f.scheduler.slot_pager(f.provider.id, None, None, 3).unwrap();
    let mut sizes = Vec::new();
    while let Some(page) = pager.next_page().await.unwrap() {
        sizes.push(page.len());
    }
    assert_eq!(sizes, vec![3, 3, 1]);
    assert!(pager.next_page().await.unwrap().is_none());

    pager.rewind();
    let first = pager.next_page().await.unwrap().unwrap();
    assert_eq!(first[0].range, at(0));
}

#[tokio::test]
async fn pager_stream_matches_listing() {
    let f = fixture("pager_stream.wal");
    for h in [4, 0, 2, 6, 1] {
        f.scheduler.add_slot(&f.provider, f.provider.id, at(h)).await.unwrap();
    }

    let streamed: Vec<Slot> = f
        .scheduler
        .slot_pager(f.provider.id, None, None, 2)
        .unwrap()
        .into_stream()
        .try_collect()
        .await
        .unwrap();
    let listed = f.scheduler.list_slots(f.provider.id, None, None).await.unwrap();
    assert_eq!(streamed, listed);
}

#[tokio::test]
async fn pager_exact_multiple_ends_cleanly() {
    let f = fixture("pager_exact.wal");
    for h in 0..4 {
        f.scheduler.add_slot(&f.provider, f.provider.id, at(h)).await.unwrap();
    }
    let mut pager = f.scheduler.slot_pager(f.provider.id, None, None, 2).unwrap();
    assert_eq!(pager.next_page().await.unwrap().unwrap().len(), 2);
    assert_eq!(pager.next_page().await.unwrap().unwrap().len(), 2);
    assert!(pager.next_page().await.unwrap().is_none());
}

#[tokio::test]
async fn remove_slot_rules() {
    let f = fixture("remove.wal");
    let open = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    let claimed = f.scheduler.add_slot(&f.provider, f.provider.id, at(1)).await.unwrap();
    f.scheduler
        .book(claimed.id, &Actor::requester(Ulid::new()), "")
        .await
        .unwrap();

    let stranger = Actor::provider(Ulid::new());
    let err = f.scheduler.remove_slot(open.id, &stranger).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let err = f.scheduler.remove_slot(claimed.id, &f.provider).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    let err = f.scheduler.remove_slot(Ulid::new(), &f.provider).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    f.scheduler.remove_slot(open.id, &f.provider).await.unwrap();
    let remaining = f.scheduler.list_slots(f.provider.id, None, None).await.unwrap();
    assert_eq!(remaining.iter().map(|s| s.id).collect::<Vec<_>>(), vec![claimed.id]);
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn booking_scenario() {
    let f = fixture("scenario.wal");
    let slot = f
        .scheduler
        .add_slot(&f.provider, f.provider.id, TimeRange::new(JAN_10_0800, JAN_10_0800 + H))
        .await
        .unwrap();

    let alice = Actor::requester(Ulid::new());
    let bob = Actor::requester(Ulid::new());

    let appt = f.scheduler.book(slot.id, &alice, "will review").await.unwrap();
    assert_eq!(appt.status, AppointmentStatus::Pending);
    assert_eq!(appt.range, slot.range);
    assert_eq!(appt.requester_id, alice.id);

    let err = f.scheduler.book(slot.id, &bob, "also me").await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ConflictReason::AlreadyBooked)));
    assert_eq!(err.to_string(), "conflict: already booked");

    let confirmed = f
        .scheduler
        .update_status(appt.id, AppointmentStatus::Confirmed, &f.provider, None)
        .await
        .unwrap();
    assert_eq!(confirmed.status, AppointmentStatus::Confirmed);

    let cancelled = f
        .scheduler
        .cancel(appt.id, &alice, Some("schedule clash"))
        .await
        .unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert_eq!(cancelled.notes, "Cancellation reason: schedule clash");

    let stored = f.scheduler.store().get_slot(slot.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SlotStatus::Claimed);

    settle().await;
    let kinds = f.notices.kinds();
    assert_eq!(kinds.len(), 3);
    assert_eq!(kinds[0], crate::notify::NoticeKind::Booked);
}

#[tokio::test]
async fn concurrent_bookings_have_one_winner() {
    let f = fixture("concurrent.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let scheduler = f.scheduler.clone();
        let requester = Actor::requester(Ulid::new());
        handles.push(tokio::spawn(async move {
            scheduler.book(slot.id, &requester, "race").await
        }));
    }

    let mut won = 0;
    let mut lost = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::Conflict(ConflictReason::AlreadyBooked)) => lost += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((won, lost), (1, 15));

    let appts = f
        .scheduler
        .list_appointments(&f.provider, AppointmentFilter::default())
        .await
        .unwrap();
    assert_eq!(appts.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_across_threads() {
    let f = fixture("concurrent_mt.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let scheduler = f.scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .book(slot.id, &Actor::requester(Ulid::new()), "")
                    .await
                    .is_ok()
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn booking_started_slot_is_expired() {
    let f = fixture("expired.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    f.clock.set(JAN_10_0800);

    let err = f
        .scheduler
        .book(slot.id, &Actor::requester(Ulid::new()), "")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ConflictReason::Expired)));
}

#[tokio::test]
async fn booking_requires_requester_role() {
    let f = fixture("book_role.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    let err = f.scheduler.book(slot.id, &f.provider, "").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
}

#[tokio::test]
async fn booking_unknown_slot_is_not_found() {
    let f = fixture("book_missing.wal");
    let err = f
        .scheduler
        .book(Ulid::new(), &Actor::requester(Ulid::new()), "")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn oversized_purpose_is_rejected() {
    let f = fixture("purpose.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    let purpose = "x".repeat(crate::limits::MAX_PURPOSE_LEN + 1);
    let err = f
        .scheduler
        .book(slot.id, &Actor::requester(Ulid::new()), &purpose)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let stored = f.scheduler.store().get_slot(slot.id).await.unwrap().unwrap();
    assert!(stored.is_open());
}

#[tokio::test]
async fn dropped_booking_future_still_commits_or_not_at_all() {
    let f = fixture("dropped.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    let requester = Actor::requester(Ulid::new());

    {
        let fut = f.scheduler.book(slot.id, &requester, "");
        tokio::pin!(fut);
        // Poll a few times then give up on the caller side.
        for _ in 0..3 {
            let _ = futures::poll!(&mut fut);
        }
    }
    settle().await;

    let stored = f.scheduler.store().get_slot(slot.id).await.unwrap().unwrap();
    let appts = f
        .scheduler
        .list_appointments(&requester, AppointmentFilter::default())
        .await
        .unwrap();
    // Slot claimed exactly when the appointment exists.
    assert_eq!(stored.status == SlotStatus::Claimed, appts.len() == 1);
}

#[tokio::test]
async fn cancel_rules() {
    let f = fixture("cancel_rules.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    let requester = Actor::requester(Ulid::new());
    let appt = f.scheduler.book(slot.id, &requester, "").await.unwrap();

    let outsider = Actor::requester(Ulid::new());
    let err = f.scheduler.cancel(appt.id, &outsider, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let cancelled = f.scheduler.cancel(appt.id, &f.provider, Some("  ")).await.unwrap();
    assert_eq!(cancelled.notes, "");

    let err = f.scheduler.cancel(appt.id, &requester, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    let err = f.scheduler.cancel(Ulid::new(), &requester, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn reopen_policy_frees_slot_for_rebooking() {
    let f = fixture_at(
        test_wal_path("reopen_policy.wal"),
        SchedulerPolicy {
            reopen_slot_on_cancel: true,
        },
    );
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    let first = Actor::requester(Ulid::new());
    let appt = f.scheduler.book(slot.id, &first, "").await.unwrap();
    f.scheduler.cancel(appt.id, &first, Some("sick")).await.unwrap();

    let stored = f.scheduler.store().get_slot(slot.id).await.unwrap().unwrap();
    assert!(stored.is_open());

    let second = Actor::requester(Ulid::new());
    let rebooked = f.scheduler.book(slot.id, &second, "").await.unwrap();
    assert_eq!(rebooked.slot_id, slot.id);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn pending_to_completed_is_invalid() {
    let f = fixture("pending_completed.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    let appt = f
        .scheduler
        .book(slot.id, &Actor::requester(Ulid::new()), "")
        .await
        .unwrap();

    let err = f
        .scheduler
        .update_status(appt.id, AppointmentStatus::Completed, &f.provider, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: AppointmentStatus::Pending,
            to: AppointmentStatus::Completed
        }
    ));
}

#[tokio::test]
async fn full_lifecycle_with_notes() {
    let f = fixture("lifecycle.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    let requester = Actor::requester(Ulid::new());
    let appt = f.scheduler.book(slot.id, &requester, "estate planning").await.unwrap();

    f.scheduler
        .update_status(appt.id, AppointmentStatus::Confirmed, &f.provider, Some("bring ID"))
        .await
        .unwrap();
    let done = f
        .scheduler
        .update_status(appt.id, AppointmentStatus::Completed, &f.provider, Some("signed"))
        .await
        .unwrap();
    assert_eq!(done.status, AppointmentStatus::Completed);
    assert_eq!(done.notes, "bring ID\nsigned");
    assert_eq!(done.purpose, "estate planning");

    let err = f
        .scheduler
        .update_status(appt.id, AppointmentStatus::Cancelled, &f.provider, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);

    settle().await;
    assert_eq!(
        f.notices.kinds()[1..],
        [
            crate::notify::NoticeKind::StatusChanged {
                from: AppointmentStatus::Pending,
                to: AppointmentStatus::Confirmed
            },
            crate::notify::NoticeKind::StatusChanged {
                from: AppointmentStatus::Confirmed,
                to: AppointmentStatus::Completed
            },
        ]
    );
}

#[tokio::test]
async fn requester_cannot_confirm() {
    let f = fixture("requester_confirm.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    let requester = Actor::requester(Ulid::new());
    let appt = f.scheduler.book(slot.id, &requester, "").await.unwrap();

    let err = f
        .scheduler
        .update_status(appt.id, AppointmentStatus::Confirmed, &requester, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let cancelled = f
        .scheduler
        .update_status(appt.id, AppointmentStatus::Cancelled, &requester, None)
        .await
        .unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
}

// ── Reads ────────────────────────────────────────────────

#[tokio::test]
async fn appointment_visibility() {
    let f = fixture("visibility.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    let requester = Actor::requester(Ulid::new());
    let appt = f.scheduler.book(slot.id, &requester, "").await.unwrap();

    assert_ok!(f.scheduler.get_appointment(appt.id, &requester).await);
    assert_ok!(f.scheduler.get_appointment(appt.id, &f.provider).await);
    assert_ok!(f.scheduler.get_appointment(appt.id, &Actor::admin(Ulid::new())).await);
    let err = f
        .scheduler
        .get_appointment(appt.id, &Actor::requester(Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let err = f
        .scheduler
        .list_appointments(
            &requester,
            AppointmentFilter {
                requester_id: Some(Ulid::new()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
}

#[tokio::test]
async fn counts_and_upcoming() {
    let f = fixture("counts.wal");
    let requester = Actor::requester(Ulid::new());
    let mut ids = Vec::new();
    for h in [3, 0, 2, 1] {
        let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(h)).await.unwrap();
        ids.push(f.scheduler.book(slot.id, &requester, "").await.unwrap().id);
    }
    // ids are in booking order: 11:00, 08:00, 10:00, 09:00
    f.scheduler
        .update_status(ids[0], AppointmentStatus::Confirmed, &f.provider, None)
        .await
        .unwrap();
    f.scheduler.cancel(ids[1], &requester, None).await.unwrap();

    let counts = f.scheduler.appointment_counts(&requester).await.unwrap();
    assert_eq!(
        (counts.pending, counts.confirmed, counts.cancelled, counts.total),
        (2, 1, 1, 4)
    );
    assert_eq!(f.scheduler.appointment_counts(&f.provider).await.unwrap(), counts);

    let upcoming = f.scheduler.upcoming_appointments(&requester, 2).await.unwrap();
    assert_eq!(
        upcoming.iter().map(|a| a.range).collect::<Vec<_>>(),
        vec![at(1), at(2)]
    );

    let confirmed_only = f
        .scheduler
        .list_appointments(
            &f.provider,
            AppointmentFilter {
                status: Some(AppointmentStatus::Confirmed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(confirmed_only.len(), 1);
    assert_eq!(confirmed_only[0].id, ids[0]);

    // Once the clock passes 10:00 only 11:00 remains upcoming.
    f.clock.set(JAN_10_0800 + 2 * H + 1);
    let upcoming = f.scheduler.upcoming_appointments(&requester, 0).await.unwrap();
    assert_eq!(upcoming.len(), 1);
    assert_eq!(upcoming[0].id, ids[0]);
}

#[tokio::test]
async fn snapshot_reflects_store() {
    let f = fixture("snapshot.wal");
    let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
    f.scheduler.book(slot.id, &Actor::requester(Ulid::new()), "").await.unwrap();

    let snap = f.scheduler.snapshot(f.provider.id).await.unwrap();
    assert_eq!(snap.slots.len(), 1);
    assert_eq!(snap.appointments.len(), 1);
    assert_eq!(snap.taken_at, f.clock.now_ms());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn restart_restores_bookings() {
    let path = test_wal_path("restart.wal");
    let requester = Actor::requester(Ulid::new());
    let (provider, appt_id) = {
        let f = fixture_at(path.clone(), SchedulerPolicy::default());
        let slot = f.scheduler.add_slot(&f.provider, f.provider.id, at(0)).await.unwrap();
        let appt = f.scheduler.book(slot.id, &requester, "").await.unwrap();
        f.scheduler
            .update_status(appt.id, AppointmentStatus::Confirmed, &f.provider, Some("ok"))
            .await
            .unwrap();
        (f.provider, appt.id)
    };

    let store = Arc::new(WalStore::open(&path).unwrap());
    let scheduler = Scheduler::new(store).with_clock(Arc::new(ManualClock::new(JAN_10_0800 - H)));
    let appt = scheduler.get_appointment(appt_id, &requester).await.unwrap();
    assert_eq!(appt.status, AppointmentStatus::Confirmed);
    assert_eq!(appt.notes, "ok");

    let err = scheduler.book(appt.slot_id, &Actor::requester(Ulid::new()), "").await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ConflictReason::AlreadyBooked)));
    assert_eq!(scheduler.list_slots(provider.id, None, None).await.unwrap().len(), 1);
}

// ── Store failures ───────────────────────────────────────

/// Delegates to a [`WalStore`] except that every claim fails in transport.
struct ClaimFailsStore {
    inner: WalStore,
    claims: AtomicU32,
}

#[async_trait]
impl ScheduleStore for ClaimFailsStore {
    async fn insert_slot_if_no_conflict(
        &self,
        id: SlotId,
        provider_id: UserId,
        range: TimeRange,
    ) -> Result<Slot, EngineError> {
        self.inner.insert_slot_if_no_conflict(id, provider_id, range).await
    }

    async fn remove_slot_if_open(&self, slot_id: SlotId) -> Result<Slot, EngineError> {
        self.inner.remove_slot_if_open(slot_id).await
    }

    async fn claim_slot_and_insert_appointment(
        &self,
        _appointment: Appointment,
    ) -> Result<Appointment, EngineError> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::Transport("connection reset".into()))
    }

    async fn update_appointment_status(
        &self,
        change: StatusChange,
    ) -> Result<Appointment, EngineError> {
        self.inner.update_appointment_status(change).await
    }

    async fn get_slot(&self, id: SlotId) -> Result<Option<Slot>, EngineError> {
        self.inner.get_slot(id).await
    }

    async fn get_appointment(&self, id: AppointmentId) -> Result<Option<Appointment>, EngineError> {
        self.inner.get_appointment(id).await
    }

    async fn list_slots_by_provider(
        &self,
        provider_id: UserId,
        window: TimeRange,
    ) -> Result<Vec<Slot>, EngineError> {
        self.inner.list_slots_by_provider(provider_id, window).await
    }

    async fn list_appointments_by_provider(
        &self,
        provider_id: UserId,
    ) -> Result<Vec<Appointment>, EngineError> {
        self.inner.list_appointments_by_provider(provider_id).await
    }

    async fn list_appointments_by_requester(
        &self,
        requester_id: UserId,
    ) -> Result<Vec<Appointment>, EngineError> {
        self.inner.list_appointments_by_requester(requester_id).await
    }

    async fn list_all_appointments(&self) -> Result<Vec<Appointment>, EngineError> {
        self.inner.list_all_appointments().await
    }

    async fn provider_state(&self, provider_id: UserId) -> Result<ProviderState, EngineError> {
        self.inner.provider_state(provider_id).await
    }
}

#[tokio::test]
async fn transport_failure_during_claim_is_reported_once() {
    let store = Arc::new(ClaimFailsStore {
        inner: WalStore::open(&test_wal_path("claim_fails.wal")).unwrap(),
        claims: AtomicU32::new(0),
    });
    let notices = Arc::new(RecordingNotifier::default());
    let scheduler = Scheduler::new(store.clone())
        .with_clock(Arc::new(ManualClock::new(JAN_10_0800 - 24 * H)))
        .with_notifier(notices.clone());
    let provider = Actor::provider(Ulid::new());
    let slot = scheduler.add_slot(&provider, provider.id, at(0)).await.unwrap();

    let err = scheduler
        .book(slot.id, &Actor::requester(Ulid::new()), "")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(store.claims.load(Ordering::SeqCst), 1);

    let slot = store.get_slot(slot.id).await.unwrap().unwrap();
    assert_eq!(slot.status, SlotStatus::Open);
    assert!(store.list_appointments_by_provider(provider.id).await.unwrap().is_empty());
    settle().await;
    assert!(!notices.kinds().contains(&NoticeKind::Booked));
}
