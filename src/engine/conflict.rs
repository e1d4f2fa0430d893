use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Shape check for a rent window: whole UTC days, `start < end`, within limits.
pub(crate) fn validate_rent_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidRequest("timestamp out of range"));
    }
    if !is_day_aligned(start) || !is_day_aligned(end) {
        return Err(EngineError::InvalidRequest("rent window must fall on UTC day boundaries"));
    }
    if start >= end {
        return Err(EngineError::InvalidRequest("rent window must end after it starts"));
    }
    if end - start > MAX_RENT_SPAN_MS {
        return Err(EngineError::LimitExceeded("rent window too long"));
    }
    Ok(Span::new(start, end))
}

/// First rent booking on the item that holds a blocking status over any part of `candidate`.
pub fn find_conflict<'a>(item: &'a ItemState, candidate: &Span) -> Option<&'a Booking> {
    item.overlapping_rentals(candidate)
        .find(|b| b.status.is_blocking())
}

/// Pending rent requests overlapping `window`, other than `except`.
pub(crate) fn competing_rentals(item: &ItemState, window: &Span, except: Ulid) -> Vec<Booking> {
    item.overlapping_rentals(window)
        .filter(|b| b.id != except && b.status == BookingStatus::Requested)
        .cloned()
        .collect()
}

/// Pending buy/give requests on the item, other than `except`.
pub(crate) fn competing_transfers(item: &ItemState, except: Ulid) -> Vec<Booking> {
    item.bookings
        .iter()
        .filter(|b| b.id != except && b.kind.is_transfer() && b.status == BookingStatus::Requested)
        .cloned()
        .collect()
}

impl Engine {
    /// Would a rent booking over `[start, end)` collide with the item's calendar right now?
    pub async fn check_conflict(&self, item_id: Ulid, start: Ms, end: Ms) -> Result<(), EngineError> {
        let span = validate_rent_window(start, end)?;
        let item = self.get_item_state(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = item.read().await;
        match find_conflict(&guard, &span) {
            Some(blocking) => Err(EngineError::Conflict(blocking.id)),
            None => Ok(()),
        }
    }
}
