use crate::model::*;
use crate::observability;

use super::{Engine, EngineError, SharedItemState, advance};

fn overdue(b: &Booking, now: Ms) -> bool {
    b.status == BookingStatus::Approved && b.handover_deadline.is_some_and(|d| d < now)
}

impl Engine {
    /// Expire every `approved` booking whose handover deadline is before `now`.
    /// Returns how many were expired. An item that fails to commit is skipped and
    /// the first such error is returned once every other item has been tried.
    pub async fn expire_overdue(&self, now: Ms) -> Result<usize, EngineError> {
        let items: Vec<SharedItemState> = self.catalog.items.iter().map(|e| e.value().clone()).collect();
        let mut expired = 0;
        let mut first_err = None;
        for item in items {
            match self.expire_item(item, now).await {
                Ok(count) => expired += count,
                Err(e) => {
                    tracing::warn!(error = %e, "expiry failed for one item; continuing");
                    first_err.get_or_insert(e);
                }
            }
        }
        metrics::counter!(observability::BOOKINGS_EXPIRED_TOTAL).increment(expired as u64);
        match first_err {
            Some(e) => Err(e),
            None => Ok(expired),
        }
    }

    async fn expire_item(&self, item: SharedItemState, now: Ms) -> Result<usize, EngineError> {
        // Cheap shared look first; most items have nothing due.
        if !item.read().await.bookings.iter().any(|b| overdue(b, now)) {
            return Ok(0);
        }
        let guard = item.write_owned().await;
        let mut txn = Txn::new(guard.id);
        for booking in guard.bookings.iter().filter(|b| overdue(b, now)) {
            let mut booking = booking.clone();
            let from = advance(&mut booking, BookingStatus::Expired)?;
            txn.events.push(self.event(
                booking.id,
                None,
                action::EXPIRE,
                Some((from, booking.status)),
                None,
                now,
            ));
            txn.bookings.push(booking);
        }
        if txn.bookings.is_empty() {
            return Ok(0);
        }
        let count = txn.bookings.len();
        let item_id = txn.item_id;
        self.commit("expire", guard, txn).await?;
        tracing::info!(item_id = %item_id, count, "expired overdue handovers");
        Ok(count)
    }
}
