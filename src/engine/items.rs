use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::{Claim, Engine, EngineError, observe};

/// The slice of the item catalog the booking engine consumes: owner and status.
impl Engine {
    pub async fn register_item(
        &self,
        item_id: Ulid,
        owner_id: Ulid,
        status: ItemStatus,
    ) -> Result<ItemInfo, EngineError> {
        observe("register_item", self.register_item_inner(item_id, owner_id, status).await)
    }

    async fn register_item_inner(
        &self,
        item_id: Ulid,
        owner_id: Ulid,
        status: ItemStatus,
    ) -> Result<ItemInfo, EngineError> {
        // Claim first, then look: a registration that commits after our check
        // still holds its claim until the item is in the map.
        let _claim = Claim::take(&self.catalog.registering, item_id)
            .ok_or(EngineError::AlreadyExists(item_id))?;
        if self.catalog.items.contains_key(&item_id) {
            return Err(EngineError::AlreadyExists(item_id));
        }
        let record = Record::ItemRegistered {
            id: item_id,
            owner_id,
            status,
        };
        self.append("register_item", record, None).await?;
        metrics::gauge!(observability::ITEMS_REGISTERED).increment(1.0);
        tracing::info!(item_id = %item_id, owner_id = %owner_id, status = %status, "item registered");
        self.get_item(item_id).await
    }

    pub async fn get_item(&self, item_id: Ulid) -> Result<ItemInfo, EngineError> {
        let item = self.get_item_state(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = item.read().await;
        Ok(guard.info())
    }

    /// External moderation write (archive, delete, restore).
    pub async fn set_item_status(&self, item_id: Ulid, status: ItemStatus) -> Result<ItemInfo, EngineError> {
        observe("set_item_status", self.set_item_status_inner(item_id, status).await)
    }

    async fn set_item_status_inner(&self, item_id: Ulid, status: ItemStatus) -> Result<ItemInfo, EngineError> {
        let guard = self.lock_item(&item_id).await?;
        let mut info = guard.info();
        if info.status == status {
            return Ok(info);
        }
        self.append("set_item_status", Record::ItemStatusSet { id: item_id, status }, Some(guard))
            .await?;
        tracing::info!(item_id = %item_id, from = %info.status, to = %status, "item status set");
        info.status = status;
        Ok(info)
    }
}
