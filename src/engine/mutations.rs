use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_PER_ITEM;
use crate::model::*;

use super::conflict::{find_conflict, validate_rent_window};
use super::{Claim, Engine, EngineError, advance, observe};

/// Window for a new booking: required and well-formed for rent, absent otherwise.
fn validate_shape(req: &NewBooking) -> Result<Option<Span>, EngineError> {
    match (req.kind, req.start, req.end) {
        (BookingType::Rent, Some(start), Some(end)) => validate_rent_window(start, end).map(Some),
        (BookingType::Rent, _, _) => Err(EngineError::InvalidRequest("rent requires start and end")),
        (_, None, None) => Ok(None),
        (_, _, _) => Err(EngineError::InvalidRequest("start and end apply to rent only")),
    }
}

impl Engine {
    /// Persist a new `requested` booking.
    pub async fn create(&self, req: NewBooking, now: Ms) -> Result<Booking, EngineError> {
        observe("create", self.create_inner(req, now).await)
    }

    async fn create_inner(&self, req: NewBooking, now: Ms) -> Result<Booking, EngineError> {
        let span = validate_shape(&req)?;
        // Held until the booking is indexed, so a racing create with the same id
        // sees either the claim or the index entry.
        let _claim =
            Claim::take(&self.catalog.creating, req.id).ok_or(EngineError::AlreadyExists(req.id))?;
        if self.item_for_booking(&req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let guard = self.lock_item(&req.item_id).await?;
        if !guard.status.accepts_bookings() {
            return Err(EngineError::ItemUnavailable {
                item: guard.id,
                status: guard.status,
            });
        }
        if req.requester_id == guard.owner_id {
            return Err(EngineError::InvalidRequest("owner cannot book their own item"));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ITEM {
            return Err(EngineError::LimitExceeded("too many bookings on item"));
        }
        if let Some(existing) = guard.bookings.iter().find(|b| {
            b.status == BookingStatus::Requested
                && b.requester_id == req.requester_id
                && b.kind == req.kind
                && b.span == span
        }) {
            return Err(EngineError::DuplicateActiveRequest(existing.id));
        }
        if let Some(span) = &span
            && let Some(blocking) = find_conflict(&guard, span)
        {
            return Err(EngineError::Conflict(blocking.id));
        }

        let booking = Booking {
            id: req.id,
            item_id: guard.id,
            requester_id: req.requester_id,
            owner_id: guard.owner_id,
            kind: req.kind,
            status: BookingStatus::Requested,
            span,
            handover_deadline: None,
            handover_confirmed_by_owner: None,
            handover_confirmed_by_requester: None,
            return_confirmed_by_owner: None,
            return_confirmed_by_requester: None,
            created_at: now,
        };
        let mut txn = Txn::new(guard.id);
        txn.events.push(self.event(
            booking.id,
            Some(booking.requester_id),
            action::CREATE,
            None,
            None,
            now,
        ));
        txn.bookings.push(booking.clone());
        self.commit("create", guard, txn).await?;

        tracing::info!(booking_id = %booking.id, item_id = %booking.item_id, kind = %booking.kind, "booking requested");
        Ok(booking)
    }

    /// Withdraw a request that hasn't been decided yet. Requester only.
    pub async fn cancel(&self, booking_id: Ulid, requester_id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        observe("cancel", self.cancel_inner(booking_id, requester_id, now).await)
    }

    async fn cancel_inner(&self, booking_id: Ulid, requester_id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        let (guard, mut booking) = self.lock_booking(&booking_id).await?;
        if booking.requester_id != requester_id {
            return Err(EngineError::Forbidden(requester_id));
        }
        if booking.status != BookingStatus::Requested {
            return Err(EngineError::InvalidState("only requested bookings can be canceled"));
        }
        let from = advance(&mut booking, BookingStatus::Canceled)?;

        let mut txn = Txn::new(booking.item_id);
        txn.events.push(self.event(
            booking.id,
            Some(requester_id),
            action::CANCEL,
            Some((from, booking.status)),
            None,
            now,
        ));
        txn.bookings.push(booking.clone());
        self.commit("cancel", guard, txn).await?;

        tracing::info!(booking_id = %booking.id, item_id = %booking.item_id, "booking canceled");
        Ok(booking)
    }
}
