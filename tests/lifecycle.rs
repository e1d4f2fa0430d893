use std::sync::Arc;
use std::time::Duration;

use bookd::engine::{Engine, EngineError, RENT_HANDOVER_GRACE_MS};
use bookd::model::*;
use bookd::sweeper::{self, SweepOutcome};
use tempfile::TempDir;
use ulid::Ulid;

// ── Test infrastructure ──────────────────────────────────────

const DAY0: Ms = 1_893_456_000_000; // 2030-01-01

fn day(n: i64) -> Ms {
    DAY0 + n * DAY_MS
}

fn start_engine() -> (Arc<Engine>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(&dir.path().join("bookings.wal")).unwrap();
    (Arc::new(engine), dir)
}

async fn item_owned_by(engine: &Engine, owner: Ulid) -> Ulid {
    let item = Ulid::new();
    engine
        .register_item(item, owner, ItemStatus::Active)
        .await
        .unwrap();
    item
}

async fn trail(engine: &Engine, booking: &Booking) -> Vec<String> {
    engine
        .list_events(booking.id, booking.owner_id, Page::default())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn approval_scenario_declines_only_the_overlap() {
    let (engine, _dir) = start_engine();
    let a = Ulid::new();
    let x = item_owned_by(&engine, a).await;
    let (b, c, d) = (Ulid::new(), Ulid::new(), Ulid::new());

    let b_req = engine
        .create(NewBooking::rent(x, b, day(10), day(15)), day(0))
        .await
        .unwrap();
    let c_req = engine
        .create(NewBooking::rent(x, c, day(12), day(14)), day(0))
        .await
        .unwrap();

    let approval = engine.approve(b_req.id, a, day(1)).await.unwrap();
    assert_eq!(approval.booking.status, BookingStatus::Approved);
    assert_eq!(
        approval.booking.handover_deadline,
        Some(day(10) + RENT_HANDOVER_GRACE_MS)
    );
    assert_eq!(approval.declined, vec![c_req.id]);

    let c_now = engine.get_booking(c_req.id).await.unwrap();
    assert_eq!(c_now.status, BookingStatus::Declined);
    assert_eq!(
        trail(&engine, &c_now).await,
        vec![action::CREATE, action::AUTO_DECLINE_COMPETITOR]
    );

    let d_req = engine
        .create(NewBooking::rent(x, d, day(20), day(25)), day(2))
        .await
        .unwrap();
    assert_eq!(
        engine.get_booking(d_req.id).await.unwrap().status,
        BookingStatus::Requested
    );

    // The approved window is now closed to new requests.
    let err = engine
        .create(NewBooking::rent(x, d, day(14), day(16)), day(2))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == b_req.id));
}

#[tokio::test]
async fn rental_from_request_to_return() {
    let (engine, _dir) = start_engine();
    let owner = Ulid::new();
    let item = item_owned_by(&engine, owner).await;
    let renter = Ulid::new();

    let booking = engine
        .create(NewBooking::rent(item, renter, day(3), day(6)), day(0))
        .await
        .unwrap();
    engine.approve(booking.id, owner, day(1)).await.unwrap();

    let first = engine.handover(booking.id, owner, day(3)).await.unwrap();
    assert_eq!(first.status, BookingStatus::Approved);
    let again = engine.handover(booking.id, owner, day(3) + 1000).await.unwrap();
    assert_eq!(again.handover_confirmed_by_owner, first.handover_confirmed_by_owner);

    let out = engine.handover(booking.id, renter, day(3)).await.unwrap();
    assert_eq!(out.status, BookingStatus::InUse);
    assert_eq!(engine.get_item(item).await.unwrap().status, ItemStatus::InUse);

    let upcoming = engine.list_upcoming_by_item(item, day(4), 10).await.unwrap();
    assert_eq!(upcoming.current.map(|b| b.id), Some(booking.id));
    assert!(engine
        .list_busy_days_by_item(item, day(0), day(10))
        .await
        .unwrap()
        .in_use_now);

    engine.return_item(booking.id, renter, day(6)).await.unwrap();
    let done = engine.return_item(booking.id, owner, day(6)).await.unwrap();
    assert_eq!(done.status, BookingStatus::Completed);
    assert_eq!(engine.get_item(item).await.unwrap().status, ItemStatus::Active);

    assert_eq!(
        trail(&engine, &done).await,
        vec![
            action::CREATE,
            action::APPROVE,
            action::HANDOVER_CONFIRM,
            action::HANDOVER_CONFIRM,
            action::STATUS_CHANGE,
            action::RETURN_CONFIRM,
            action::RETURN_CONFIRM,
            action::STATUS_CHANGE,
        ]
    );
}

#[tokio::test]
async fn sale_moves_item_out_of_circulation() {
    let (engine, _dir) = start_engine();
    let seller = Ulid::new();
    let item = item_owned_by(&engine, seller).await;
    let (buyer, other) = (Ulid::new(), Ulid::new());

    let sale = engine
        .create(NewBooking::transfer(item, buyer, BookingType::Buy), day(0))
        .await
        .unwrap();
    let gift = engine
        .create(NewBooking::transfer(item, other, BookingType::Give), day(0))
        .await
        .unwrap();

    let approval = engine.approve(sale.id, seller, day(1)).await.unwrap();
    assert_eq!(approval.declined, vec![gift.id]);

    let pending = engine.handover(sale.id, buyer, day(2)).await.unwrap();
    assert_eq!(pending.status, BookingStatus::HandoverPending);
    let done = engine.handover(sale.id, seller, day(2)).await.unwrap();
    assert_eq!(done.status, BookingStatus::Completed);
    assert_eq!(
        engine.get_item(item).await.unwrap().status,
        ItemStatus::Transferred
    );

    let err = engine
        .create(NewBooking::rent(item, other, day(5), day(6)), day(3))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ItemUnavailable { .. }));
}

#[tokio::test]
async fn cancel_is_requester_only_and_pre_decision() {
    let (engine, _dir) = start_engine();
    let owner = Ulid::new();
    let item = item_owned_by(&engine, owner).await;
    let renter = Ulid::new();

    let booking = engine
        .create(NewBooking::rent(item, renter, day(1), day(2)), day(0))
        .await
        .unwrap();
    assert!(matches!(
        engine.cancel(booking.id, owner, day(0)).await,
        Err(EngineError::Forbidden(_))
    ));
    let canceled = engine.cancel(booking.id, renter, day(0)).await.unwrap();
    assert_eq!(canceled.status, BookingStatus::Canceled);
    assert!(matches!(
        engine.cancel(booking.id, renter, day(0)).await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test]
async fn sweep_frees_the_calendar() {
    let (engine, _dir) = start_engine();
    let owner = Ulid::new();
    let item = item_owned_by(&engine, owner).await;

    let booking = engine
        .create(NewBooking::rent(item, Ulid::new(), day(10), day(12)), day(0))
        .await
        .unwrap();
    engine.approve(booking.id, owner, day(1)).await.unwrap();
    let busy = engine.list_busy_days_by_item(item, day(0), day(30)).await.unwrap();
    assert_eq!(busy.busy, vec![Span::new(day(10), day(12))]);

    let late = day(10) + RENT_HANDOVER_GRACE_MS + 1;
    let outcome = sweeper::sweep_once(&engine, late, Duration::from_secs(5)).await;
    assert_eq!(outcome, SweepOutcome::Expired(1));

    assert_eq!(
        engine.get_booking(booking.id).await.unwrap().status,
        BookingStatus::Expired
    );
    let busy = engine.list_busy_days_by_item(item, day(0), day(30)).await.unwrap();
    assert!(busy.busy.is_empty());

    // Too late to hand over now.
    assert!(matches!(
        engine.handover(booking.id, owner, late).await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bookings.wal");
    let owner = Ulid::new();
    let renter = Ulid::new();

    let (item, booking) = {
        let engine = Engine::open(&path).unwrap();
        let item = item_owned_by(&engine, owner).await;
        let booking = engine
            .create(NewBooking::rent(item, renter, day(2), day(4)), day(0))
            .await
            .unwrap();
        engine.approve(booking.id, owner, day(1)).await.unwrap();
        engine.handover(booking.id, renter, day(2)).await.unwrap();
        (item, booking.id)
    };

    let engine = Engine::open(&path).unwrap();
    let restored = engine.get_booking(booking).await.unwrap();
    assert_eq!(restored.status, BookingStatus::Approved);
    assert!(restored.handover_confirmed_by_requester.is_some());
    assert!(restored.handover_confirmed_by_owner.is_none());

    let mine = engine
        .list_my_bookings(renter, &[], Page::default())
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);

    let out = engine.handover(booking, owner, day(2)).await.unwrap();
    assert_eq!(out.status, BookingStatus::InUse);
    assert_eq!(engine.get_item(item).await.unwrap().status, ItemStatus::InUse);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let (engine, _dir) = start_engine();
    let stranger = Ulid::new();
    assert!(matches!(
        engine.get_booking(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine
            .create(NewBooking::rent(Ulid::new(), stranger, day(1), day(2)), day(0))
            .await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.approve(Ulid::new(), stranger, day(0)).await,
        Err(EngineError::NotFound(_))
    ));
}
