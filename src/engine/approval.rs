use ulid::Ulid;

use crate::model::*;

use super::conflict::{competing_rentals, competing_transfers};
use super::{Engine, EngineError, advance, observe};

/// Buy/give handovers must happen within ten days of approval.
pub const TRANSFER_HANDOVER_WINDOW_MS: Ms = 240 * HOUR_MS;

/// Rent handovers must happen within a day of the window's start.
pub const RENT_HANDOVER_GRACE_MS: Ms = 24 * HOUR_MS;

impl Engine {
    /// Owner accepts a request. Every competing request on the item is declined in the
    /// same commit: overlapping rent requests for rent, all other buy/give requests
    /// for a transfer.
    pub async fn approve(&self, booking_id: Ulid, owner_id: Ulid, now: Ms) -> Result<Approval, EngineError> {
        observe("approve", self.approve_inner(booking_id, owner_id, now).await)
    }

    async fn approve_inner(&self, booking_id: Ulid, owner_id: Ulid, now: Ms) -> Result<Approval, EngineError> {
        let (guard, mut target) = self.lock_booking(&booking_id).await?;
        if target.owner_id != owner_id {
            return Err(EngineError::Forbidden(owner_id));
        }
        if target.status != BookingStatus::Requested {
            return Err(EngineError::InvalidState("booking is not awaiting approval"));
        }

        let (deadline, competitors, approve_action, decline_action) = match target.kind {
            BookingType::Rent => {
                let span = target
                    .span
                    .ok_or(EngineError::InvalidState("rent booking has no window"))?;
                (
                    span.start + RENT_HANDOVER_GRACE_MS,
                    competing_rentals(&guard, &span, target.id),
                    action::APPROVE,
                    action::AUTO_DECLINE_COMPETITOR,
                )
            }
            BookingType::Buy | BookingType::Give => (
                now + TRANSFER_HANDOVER_WINDOW_MS,
                competing_transfers(&guard, target.id),
                action::APPROVE_TRANSFER,
                action::AUTO_DECLINE_TRANSFER,
            ),
        };

        let from = advance(&mut target, BookingStatus::Approved)?;
        target.handover_deadline = Some(deadline);

        let mut txn = Txn::new(target.item_id);
        txn.events.push(self.event(
            target.id,
            Some(owner_id),
            approve_action,
            Some((from, target.status)),
            None,
            now,
        ));
        txn.bookings.push(target.clone());

        let mut declined = Vec::with_capacity(competitors.len());
        for mut rival in competitors {
            let from = advance(&mut rival, BookingStatus::Declined)?;
            txn.events.push(self.event(
                rival.id,
                Some(owner_id),
                decline_action,
                Some((from, rival.status)),
                Some(serde_json::json!({ "approved_booking_id": target.id.to_string() })),
                now,
            ));
            declined.push(rival.id);
            txn.bookings.push(rival);
        }

        self.commit("approve", guard, txn).await?;
        tracing::info!(
            booking_id = %target.id,
            item_id = %target.item_id,
            declined = declined.len(),
            deadline,
            "booking approved"
        );
        Ok(Approval {
            booking: target,
            declined,
        })
    }
}
