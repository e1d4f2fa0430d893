mod approval;
mod conflict;
mod error;
mod expiry;
mod handshake;
mod items;
mod mutations;
mod queries;
mod sync;

pub use approval::{RENT_HANDOVER_GRACE_MS, TRANSFER_HANDOVER_WINDOW_MS};
pub use conflict::{find_conflict, now_ms};
pub use error::EngineError;
pub use sync::derive_item_status;

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedItemState = Arc<RwLock<ItemState>>;
pub(crate) type ItemGuard = OwnedRwLockWriteGuard<ItemState>;

/// Item map plus the reverse indexes. Shared with the WAL writer, which is the
/// only place committed records are applied.
#[derive(Default)]
pub(crate) struct Catalog {
    items: DashMap<Ulid, SharedItemState>,
    booking_to_item: DashMap<Ulid, Ulid>,
    by_requester: DashMap<Ulid, Vec<Ulid>>,
    by_owner: DashMap<Ulid, Vec<Ulid>>,
    /// Item ids with a registration in flight.
    registering: DashSet<Ulid>,
    /// Booking ids with a create in flight.
    creating: DashSet<Ulid>,
}

/// An id held in one of the catalog's in-flight sets until dropped.
pub(crate) struct Claim<'a> {
    set: &'a DashSet<Ulid>,
    id: Ulid,
}

impl<'a> Claim<'a> {
    /// `None` if someone else holds `id` right now.
    fn take(set: &'a DashSet<Ulid>, id: Ulid) -> Option<Self> {
        set.insert(id).then_some(Self { set, id })
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

impl Catalog {
    /// Returns false if the id was already taken; the existing item is kept.
    fn register(&self, id: Ulid, owner_id: Ulid, status: ItemStatus) -> bool {
        match self.items.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RwLock::new(ItemState::new(id, owner_id, status))));
                true
            }
        }
    }

    /// Apply a committed item-scoped record. Caller holds the item's write lock.
    fn apply_to(&self, state: &mut ItemState, record: Record) {
        match record {
            Record::ItemStatusSet { status, .. } => state.status = status,
            Record::Committed(txn) => {
                for booking in txn.bookings {
                    let (id, requester, owner) = (booking.id, booking.requester_id, booking.owner_id);
                    match state.upsert_booking(booking) {
                        Upsert::Inserted => {
                            self.booking_to_item.insert(id, state.id);
                            self.by_requester.entry(requester).or_default().push(id);
                            self.by_owner.entry(owner).or_default().push(id);
                        }
                        Upsert::Replaced => {}
                        Upsert::Rejected => {
                            tracing::error!(booking_id = %id, item_id = %state.id, "refusing to overwrite a different booking with the same id")
                        }
                    }
                }
                state.events.extend(txn.events);
                if let Some(status) = txn.item_status {
                    state.status = status;
                }
            }
            Record::ItemRegistered { .. } => {}
        }
    }

    /// One registration plus one snapshot commit per item. `None` if any item is
    /// locked right now.
    fn snapshot(&self) -> Option<Vec<Record>> {
        let mut records = Vec::with_capacity(self.items.len() * 2);
        for entry in self.items.iter() {
            let state = entry.value().try_read().ok()?;
            records.push(Record::ItemRegistered {
                id: state.id,
                owner_id: state.owner_id,
                status: state.status,
            });
            if !state.bookings.is_empty() || !state.events.is_empty() {
                records.push(Record::Committed(Txn {
                    item_id: state.id,
                    bookings: state.bookings.clone(),
                    events: state.events.clone(),
                    item_status: None,
                }));
            }
        }
        Some(records)
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    /// `guard` is the write lock the record was built under. The writer applies the
    /// record through it after fsync and only then releases it, so a caller that
    /// stops waiting can never leave durable and in-memory state apart.
    Append {
        record: Record,
        guard: Option<ItemGuard>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<bool>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

struct PendingAppend {
    record: Record,
    guard: Option<ItemGuard>,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. Write them all, one fsync.
/// 4. Apply each record to memory, release its lock, respond.
async fn wal_writer_loop(mut wal: Wal, catalog: Arc<Catalog>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append {
                record,
                guard,
                response,
            } => {
                let mut batch = vec![PendingAppend {
                    record,
                    guard,
                    response,
                }];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append {
                            record,
                            guard,
                            response,
                        }) => batch.push(PendingAppend {
                            record,
                            guard,
                            response,
                        }),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &catalog, batch);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, &catalog, cmd);
                }
            }
            other => handle_non_append(&mut wal, &catalog, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, catalog: &Catalog, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            for PendingAppend {
                record,
                mut guard,
                response,
            } in batch
            {
                match record {
                    Record::ItemRegistered { id, owner_id, status } => {
                        if !catalog.register(id, owner_id, status) {
                            tracing::warn!(item_id = %id, "duplicate registration ignored");
                        }
                    }
                    record => match guard.as_deref_mut() {
                        Some(state) => catalog.apply_to(state, record),
                        None => {
                            tracing::error!(item_id = %record.item_id(), "record committed without its item lock")
                        }
                    },
                }
                drop(guard);
                let _ = response.send(Ok(()));
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, batch = batch.len(), "WAL flush failed");
            for pending in batch {
                let _ = pending.response.send(Err(io::Error::new(e.kind(), e.to_string())));
            }
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for pending in batch {
        if let Err(e) = wal.append_buffered(&pending.record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, catalog: &Catalog, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let result = match catalog.snapshot() {
                Some(records) => wal.compact(&records).map(|()| true),
                None => Ok(false),
            };
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// Transition `booking` along a state-machine edge; any other move is `InvalidState`.
pub(crate) fn advance(booking: &mut Booking, next: BookingStatus) -> Result<BookingStatus, EngineError> {
    let from = booking.status;
    if !from.can_transition_to(next, booking.kind) {
        return Err(EngineError::InvalidState("transition not permitted"));
    }
    booking.status = next;
    Ok(from)
}

/// Count the outcome of a public operation.
pub(crate) fn observe<T>(op: &'static str, result: Result<T, EngineError>) -> Result<T, EngineError> {
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(observability::OPERATIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
    result
}

/// The booking engine: every item's bookings and audit trail in memory, made durable
/// by the WAL before any change becomes visible.
pub struct Engine {
    catalog: Arc<Catalog>,
    wal_tx: mpsc::Sender<WalCommand>,
    next_event_id: AtomicU64,
    /// Items whose commits fail as if the WAL were broken.
    #[cfg(test)]
    failing_items: DashSet<Ulid>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must run inside a Tokio runtime.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let (wal, records) = Wal::open(wal_path)?;
        let catalog = Arc::new(Catalog::default());

        // Replay into plain owned state first; nothing else can see it yet.
        let mut items: HashMap<Ulid, ItemState> = HashMap::new();
        let mut next_event_id = 1u64;
        for record in records {
            match record {
                Record::ItemRegistered { id, owner_id, status } => {
                    items
                        .entry(id)
                        .or_insert_with(|| ItemState::new(id, owner_id, status));
                }
                other => {
                    if let Record::Committed(txn) = &other
                        && let Some(max) = txn.events.iter().map(|e| e.id).max()
                    {
                        next_event_id = next_event_id.max(max + 1);
                    }
                    match items.get_mut(&other.item_id()) {
                        Some(state) => catalog.apply_to(state, other),
                        None => tracing::warn!(item_id = %other.item_id(), "replay: record for unknown item"),
                    }
                }
            }
        }
        let item_count = items.len();
        for (id, state) in items {
            catalog.items.insert(id, Arc::new(RwLock::new(state)));
        }
        metrics::gauge!(observability::ITEMS_REGISTERED).set(item_count as f64);
        tracing::info!(items = item_count, path = %wal_path.display(), "booking engine opened");

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, catalog.clone(), wal_rx));

        Ok(Self {
            catalog,
            wal_tx,
            next_event_id: AtomicU64::new(next_event_id),
            #[cfg(test)]
            failing_items: DashSet::new(),
        })
    }

    /// Hand a record (and the lock it was built under) to the group-commit writer.
    async fn append(&self, op: &'static str, record: Record, guard: Option<ItemGuard>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record,
                guard,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::storage(op, io::Error::other("WAL writer shut down")))?;
        rx.await
            .map_err(|_| EngineError::storage(op, io::Error::other("WAL writer dropped response")))?
            .map_err(|e| EngineError::storage(op, e))
    }

    /// Commit `txn` atomically. Consumes the item's write guard; it is released once
    /// the change is both durable and applied.
    pub(crate) async fn commit(&self, op: &'static str, guard: ItemGuard, txn: Txn) -> Result<(), EngineError> {
        #[cfg(test)]
        if self.failing_items.contains(&txn.item_id) {
            return Err(EngineError::storage(op, io::Error::other("injected WAL failure")));
        }
        self.append(op, Record::Committed(txn), Some(guard)).await
    }

    pub(crate) fn event(
        &self,
        booking_id: Ulid,
        actor_user_id: Option<Ulid>,
        action: &str,
        transition: Option<(BookingStatus, BookingStatus)>,
        meta: Option<serde_json::Value>,
        now: Ms,
    ) -> BookingEvent {
        BookingEvent {
            id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            booking_id,
            actor_user_id,
            action: action.to_string(),
            from_status: transition.map(|(from, _)| from),
            to_status: transition.map(|(_, to)| to),
            meta,
            created_at: now,
        }
    }

    pub fn get_item_state(&self, item_id: &Ulid) -> Option<SharedItemState> {
        self.catalog.items.get(item_id).map(|e| e.value().clone())
    }

    pub fn item_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.catalog.booking_to_item.get(booking_id).map(|e| *e.value())
    }

    pub(crate) async fn lock_item(&self, item_id: &Ulid) -> Result<ItemGuard, EngineError> {
        let item = self.get_item_state(item_id).ok_or(EngineError::NotFound(*item_id))?;
        Ok(item.write_owned().await)
    }

    /// Lock the booking's item and return the booking as currently stored.
    pub(crate) async fn lock_booking(&self, booking_id: &Ulid) -> Result<(ItemGuard, Booking), EngineError> {
        let item_id = self
            .item_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = self.lock_item(&item_id).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(*booking_id))?;
        Ok((guard, booking))
    }

    /// Rewrite the WAL as a snapshot of the current state. `Ok(false)` when skipped
    /// because an item was busy.
    pub async fn compact(&self) -> Result<bool, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::storage("compact", io::Error::other("WAL writer shut down")))?;
        rx.await
            .map_err(|_| EngineError::storage("compact", io::Error::other("WAL writer dropped response")))?
            .map_err(|e| EngineError::storage("compact", e))
    }

    pub async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::storage("wal_stats", io::Error::other("WAL writer shut down")))?;
        rx.await
            .map_err(|_| EngineError::storage("wal_stats", io::Error::other("WAL writer dropped response")))
    }
}

/// `{"by": "owner"|"requester"}` payload of confirmation events.
pub(crate) fn confirmed_by(party: Party) -> serde_json::Value {
    serde_json::json!({ "by": party.as_str() })
}
