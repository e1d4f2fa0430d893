use std::collections::HashMap;

use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, SharedItemState};

fn paginate<T>(rows: Vec<T>, page: &Page, default: usize, max: usize) -> Vec<T> {
    let limit = page.limit_or(default, max);
    rows.into_iter().skip(page.offset).take(limit).collect()
}

/// Newest first, ties broken by id.
fn newest_first(rows: &mut [Booking]) {
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

impl Engine {
    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let item_id = self
            .item_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let item = self.get_item_state(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = item.read().await;
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Bookings listed in `index` under `user`, visiting each item once.
    async fn indexed_bookings(
        &self,
        index: &DashMap<Ulid, Vec<Ulid>>,
        user: Ulid,
        keep: impl Fn(&Booking) -> bool,
    ) -> Vec<Booking> {
        let ids = index.get(&user).map(|e| e.value().clone()).unwrap_or_default();
        let mut by_item: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for id in ids {
            if let Some(item_id) = self.item_for_booking(&id) {
                by_item.entry(item_id).or_default().push(id);
            }
        }

        let mut rows = Vec::new();
        for (item_id, ids) in by_item {
            let Some(item) = self.get_item_state(&item_id) else {
                continue;
            };
            let guard = item.read().await;
            rows.extend(
                ids.iter()
                    .filter_map(|id| guard.booking(id))
                    .filter(|b| keep(b))
                    .cloned(),
            );
        }
        rows
    }

    /// Bookings the user requested, newest first. Empty `statuses` means all.
    pub async fn list_my_bookings(
        &self,
        requester_id: Ulid,
        statuses: &[BookingStatus],
        page: Page,
    ) -> Result<Vec<Booking>, EngineError> {
        let mut rows = self
            .indexed_bookings(&self.catalog.by_requester, requester_id, |b| {
                statuses.is_empty() || statuses.contains(&b.status)
            })
            .await;
        newest_first(&mut rows);
        Ok(paginate(rows, &page, DEFAULT_BOOKING_PAGE, MAX_BOOKING_PAGE))
    }

    /// Bookings on items the user owns, newest first. Empty `statuses` means all.
    pub async fn list_my_items_bookings(
        &self,
        owner_id: Ulid,
        statuses: &[BookingStatus],
        page: Page,
    ) -> Result<Vec<Booking>, EngineError> {
        let mut rows = self
            .indexed_bookings(&self.catalog.by_owner, owner_id, |b| {
                statuses.is_empty() || statuses.contains(&b.status)
            })
            .await;
        newest_first(&mut rows);
        Ok(paginate(rows, &page, DEFAULT_BOOKING_PAGE, MAX_BOOKING_PAGE))
    }

    /// The owner's inbox: `requested` bookings, optionally narrowed to some deal types.
    pub async fn list_booking_requests(
        &self,
        owner_id: Ulid,
        types: &[BookingType],
        page: Page,
    ) -> Result<Vec<Booking>, EngineError> {
        let mut rows = self
            .indexed_bookings(&self.catalog.by_owner, owner_id, |b| {
                b.status == BookingStatus::Requested && (types.is_empty() || types.contains(&b.kind))
            })
            .await;
        newest_first(&mut rows);
        Ok(paginate(rows, &page, DEFAULT_BOOKING_PAGE, MAX_BOOKING_PAGE))
    }

    /// A booking's audit trail, oldest first. Only its owner and requester may read it.
    pub async fn list_events(
        &self,
        booking_id: Ulid,
        viewer_id: Ulid,
        page: Page,
    ) -> Result<Vec<BookingEvent>, EngineError> {
        let item_id = self
            .item_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let item = self.get_item_state(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = item.read().await;
        let booking = guard
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.party(viewer_id).is_none() {
            return Err(EngineError::Forbidden(viewer_id));
        }
        let mut rows: Vec<BookingEvent> = guard.events_for(booking_id).cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(paginate(rows, &page, DEFAULT_EVENT_PAGE, MAX_EVENT_PAGE))
    }

    /// Cross-booking audit read for moderation, newest first.
    pub async fn list_audit_events(&self, filter: EventFilter) -> Result<Vec<BookingEvent>, EngineError> {
        let scope_item = match (filter.booking_id, filter.item_id) {
            (Some(booking_id), _) => match self.item_for_booking(&booking_id) {
                Some(item_id) => Some(item_id),
                None => return Ok(Vec::new()),
            },
            (None, item_id) => item_id,
        };
        let items: Vec<SharedItemState> = match scope_item {
            Some(item_id) => self.get_item_state(&item_id).into_iter().collect(),
            None => self.catalog.items.iter().map(|e| e.value().clone()).collect(),
        };

        let mut rows = Vec::new();
        for item in items {
            let guard = item.read().await;
            if filter.item_id.is_some_and(|id| id != guard.id) {
                continue;
            }
            rows.extend(
                guard
                    .events
                    .iter()
                    .filter(|e| filter.booking_id.is_none_or(|id| e.booking_id == id))
                    .filter(|e| filter.actor_user_id.is_none_or(|id| e.actor_user_id == Some(id)))
                    .cloned(),
            );
        }
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(paginate(rows, &filter.page, DEFAULT_EVENT_PAGE, MAX_EVENT_PAGE))
    }

    /// The rental currently out (if any) and approved rentals starting after `now`.
    pub async fn list_upcoming_by_item(&self, item_id: Ulid, now: Ms, limit: usize) -> Result<Upcoming, EngineError> {
        let item = self.get_item_state(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = item.read().await;
        let rentals = || guard.bookings.iter().filter(|b| b.kind == BookingType::Rent);

        let current = rentals()
            .filter(|b| b.status.is_in_custody())
            .max_by_key(|b| b.start())
            .cloned();

        let limit = Page {
            limit: Some(limit),
            offset: 0,
        }
        .limit_or(DEFAULT_UPCOMING, MAX_UPCOMING);
        let mut upcoming: Vec<Booking> = rentals()
            .filter(|b| b.status == BookingStatus::Approved && b.start().is_some_and(|s| s > now))
            .cloned()
            .collect();
        upcoming.sort_by_key(|b| (b.start(), b.id));
        upcoming.truncate(limit);

        Ok(Upcoming { current, upcoming })
    }

    /// Calendar occupancy over the day window `[from_day, to_day)`: every rent booking
    /// in a blocking status, clamped to the window.
    ///
    /// `to_day` is exclusive. A booking that starts on `to_day` is not returned; to
    /// include the whole of a last day `d`, pass `d + DAY_MS`.
    pub async fn list_busy_days_by_item(&self, item_id: Ulid, from_day: Ms, to_day: Ms) -> Result<BusyDays, EngineError> {
        if !is_day_aligned(from_day) || !is_day_aligned(to_day) {
            return Err(EngineError::InvalidRequest("window must fall on UTC day boundaries"));
        }
        if from_day >= to_day {
            return Err(EngineError::InvalidRequest("window must end after it starts"));
        }
        if to_day - from_day > MAX_BUSY_WINDOW_DAYS * DAY_MS {
            return Err(EngineError::InvalidRequest("window too large (max 180 days)"));
        }
        let item = self.get_item_state(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = item.read().await;
        let window = Span::new(from_day, to_day);

        let busy = guard
            .overlapping_rentals(&window)
            .filter(|b| b.status.is_blocking())
            .filter_map(|b| b.span.and_then(|s| s.clamp_to(&window)))
            .collect();
        let in_use_now = guard
            .bookings
            .iter()
            .any(|b| b.kind == BookingType::Rent && b.status.is_in_custody());

        Ok(BusyDays { busy, in_use_now })
    }
}
