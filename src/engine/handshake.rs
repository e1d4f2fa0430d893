use ulid::Ulid;

use crate::model::*;

use super::sync::derive_item_status;
use super::{Engine, EngineError, ItemGuard, advance, confirmed_by, observe};

impl Engine {
    /// One party confirms that the item changed hands. Rent bookings go to `in_use`
    /// once both have confirmed; buy/give go through `handover_pending` to `completed`.
    pub async fn handover(&self, booking_id: Ulid, actor_id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        observe("handover", self.handover_inner(booking_id, actor_id, now).await)
    }

    async fn handover_inner(&self, booking_id: Ulid, actor_id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        let (guard, booking) = self.lock_booking(&booking_id).await?;
        let party = booking.party(actor_id).ok_or(EngineError::Forbidden(actor_id))?;
        if booking.kind.is_transfer() {
            self.handover_transfer(guard, booking, actor_id, party, now).await
        } else {
            self.handover_rent(guard, booking, actor_id, party, now).await
        }
    }

    async fn handover_rent(
        &self,
        guard: ItemGuard,
        mut booking: Booking,
        actor_id: Ulid,
        party: Party,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        if booking.status != BookingStatus::Approved {
            return Err(EngineError::InvalidState("booking is not approved"));
        }
        check_deadline(&booking, now)?;
        if !booking.confirm_handover(party, now) {
            tracing::debug!(booking_id = %booking.id, by = party.as_str(), "handover already confirmed");
            return Ok(booking);
        }

        let mut txn = Txn::new(booking.item_id);
        txn.events.push(self.event(
            booking.id,
            Some(actor_id),
            action::HANDOVER_CONFIRM,
            None,
            Some(confirmed_by(party)),
            now,
        ));
        if booking.handover_confirmed() {
            let from = advance(&mut booking, BookingStatus::InUse)?;
            txn.events.push(self.event(
                booking.id,
                Some(actor_id),
                action::STATUS_CHANGE,
                Some((from, booking.status)),
                None,
                now,
            ));
            txn.item_status = derive_item_status(&guard, std::slice::from_ref(&booking));
        }
        txn.bookings.push(booking.clone());
        self.commit("handover", guard, txn).await?;

        tracing::info!(booking_id = %booking.id, by = party.as_str(), status = %booking.status, "handover confirmed");
        Ok(booking)
    }

    async fn handover_transfer(
        &self,
        guard: ItemGuard,
        mut booking: Booking,
        actor_id: Ulid,
        party: Party,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        match booking.status {
            BookingStatus::Approved => check_deadline(&booking, now)?,
            BookingStatus::HandoverPending => {}
            _ => return Err(EngineError::InvalidState("booking is not awaiting handover")),
        }
        if !booking.confirm_handover(party, now) {
            tracing::debug!(booking_id = %booking.id, by = party.as_str(), "handover already confirmed");
            return Ok(booking);
        }

        let mut txn = Txn::new(booking.item_id);
        if booking.handover_confirmed() {
            let from = advance(&mut booking, BookingStatus::Completed)?;
            txn.events.push(self.event(
                booking.id,
                Some(actor_id),
                action::COMPLETE_TRANSFER,
                Some((from, booking.status)),
                Some(confirmed_by(party)),
                now,
            ));
            if !guard.status.is_terminal() {
                txn.item_status = Some(ItemStatus::Transferred);
            }
        } else {
            let from = advance(&mut booking, BookingStatus::HandoverPending)?;
            txn.events.push(self.event(
                booking.id,
                Some(actor_id),
                action::HANDOVER_TRANSFER_CONFIRM,
                Some((from, booking.status)),
                Some(confirmed_by(party)),
                now,
            ));
        }
        txn.bookings.push(booking.clone());
        self.commit("handover", guard, txn).await?;

        tracing::info!(booking_id = %booking.id, by = party.as_str(), status = %booking.status, "transfer handover confirmed");
        Ok(booking)
    }

    /// One party confirms the rented item came back. `completed` once both have.
    pub async fn return_item(&self, booking_id: Ulid, actor_id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        observe("return", self.return_inner(booking_id, actor_id, now).await)
    }

    async fn return_inner(&self, booking_id: Ulid, actor_id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        let (guard, mut booking) = self.lock_booking(&booking_id).await?;
        if booking.kind != BookingType::Rent {
            return Err(EngineError::InvalidState("only rentals are returned"));
        }
        let party = booking.party(actor_id).ok_or(EngineError::Forbidden(actor_id))?;
        if !booking.status.is_in_custody() {
            return Err(EngineError::InvalidState("booking is not in use"));
        }
        if !booking.confirm_return(party, now) {
            tracing::debug!(booking_id = %booking.id, by = party.as_str(), "return already confirmed");
            return Ok(booking);
        }

        let mut txn = Txn::new(booking.item_id);
        txn.events.push(self.event(
            booking.id,
            Some(actor_id),
            action::RETURN_CONFIRM,
            None,
            Some(confirmed_by(party)),
            now,
        ));
        if booking.return_confirmed() {
            let from = advance(&mut booking, BookingStatus::Completed)?;
            txn.events.push(self.event(
                booking.id,
                Some(actor_id),
                action::STATUS_CHANGE,
                Some((from, booking.status)),
                None,
                now,
            ));
            txn.item_status = derive_item_status(&guard, std::slice::from_ref(&booking));
        }
        txn.bookings.push(booking.clone());
        self.commit("return", guard, txn).await?;

        tracing::info!(booking_id = %booking.id, by = party.as_str(), status = %booking.status, "return confirmed");
        Ok(booking)
    }
}

/// `now` must not be past the handover deadline.
fn check_deadline(booking: &Booking, now: Ms) -> Result<(), EngineError> {
    match booking.handover_deadline {
        Some(deadline) if now > deadline => Err(EngineError::InvalidState("handover deadline has passed")),
        _ => Ok(()),
    }
}
