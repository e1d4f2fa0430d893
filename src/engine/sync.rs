use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, observe};

/// The availability flag `item` should carry, reading `changed` in place of the
/// stored rows with the same ids. `None` if the item is terminal or already right.
pub fn derive_item_status(item: &ItemState, changed: &[Booking]) -> Option<ItemStatus> {
    if item.status.is_terminal() {
        return None;
    }
    let in_custody = |b: &Booking| b.kind == BookingType::Rent && b.status.is_in_custody();
    let occupied = changed.iter().any(in_custody)
        || item
            .bookings
            .iter()
            .filter(|b| !changed.iter().any(|c| c.id == b.id))
            .any(in_custody);
    let next = if occupied {
        ItemStatus::InUse
    } else {
        ItemStatus::Active
    };
    (next != item.status).then_some(next)
}

impl Engine {
    /// Recompute and persist an item's availability flag from its bookings.
    pub async fn sync_item_status(&self, item_id: Ulid) -> Result<ItemStatus, EngineError> {
        observe("sync_item_status", self.sync_item_status_inner(item_id).await)
    }

    async fn sync_item_status_inner(&self, item_id: Ulid) -> Result<ItemStatus, EngineError> {
        let guard = self.lock_item(&item_id).await?;
        let Some(next) = derive_item_status(&guard, &[]) else {
            return Ok(guard.status);
        };
        let mut txn = Txn::new(item_id);
        txn.item_status = Some(next);
        self.commit("sync_item_status", guard, txn).await?;
        tracing::info!(item_id = %item_id, status = %next, "item status synchronized");
        Ok(next)
    }
}
