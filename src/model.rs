use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Midnight (UTC) of the day containing `t`.
pub fn day_floor(t: Ms) -> Ms {
    t.div_euclid(DAY_MS) * DAY_MS
}

pub fn is_day_aligned(t: Ms) -> bool {
    t.rem_euclid(DAY_MS) == 0
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Whole UTC days `[first_day, end_day)`, counted from the epoch.
    pub fn days(first_day: i64, end_day: i64) -> Self {
        Self::new(first_day * DAY_MS, end_day * DAY_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// The part of `self` inside `window`, if any.
    pub fn clamp_to(&self, window: &Span) -> Option<Span> {
        let start = self.start.max(window.start);
        let end = self.end.min(window.end);
        (start < end).then_some(Span { start, end })
    }
}

/// Deal type of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingType {
    Rent,
    Buy,
    Give,
}

impl BookingType {
    pub const ALL: [BookingType; 3] = [BookingType::Rent, BookingType::Buy, BookingType::Give];

    /// Buy and give hand the item over for good; rent brings it back.
    pub fn is_transfer(self) -> bool {
        match self {
            BookingType::Rent => false,
            BookingType::Buy | BookingType::Give => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingType::Rent => "rent",
            BookingType::Buy => "buy",
            BookingType::Give => "give",
        }
    }
}

impl fmt::Display for BookingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Requested,
    Approved,
    HandoverPending,
    InUse,
    ReturnPending,
    Completed,
    Declined,
    Canceled,
    Expired,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 9] = [
        BookingStatus::Requested,
        BookingStatus::Approved,
        BookingStatus::HandoverPending,
        BookingStatus::InUse,
        BookingStatus::ReturnPending,
        BookingStatus::Completed,
        BookingStatus::Declined,
        BookingStatus::Canceled,
        BookingStatus::Expired,
    ];

    /// Statuses that occupy the item (and, for rent, its calendar).
    pub fn is_blocking(self) -> bool {
        match self {
            BookingStatus::Approved
            | BookingStatus::HandoverPending
            | BookingStatus::InUse
            | BookingStatus::ReturnPending => true,
            BookingStatus::Requested
            | BookingStatus::Completed
            | BookingStatus::Declined
            | BookingStatus::Canceled
            | BookingStatus::Expired => false,
        }
    }

    /// The requester physically holds the item.
    pub fn is_in_custody(self) -> bool {
        matches!(self, BookingStatus::InUse | BookingStatus::ReturnPending)
    }

    pub fn is_terminal(self) -> bool {
        match self {
            BookingStatus::Completed
            | BookingStatus::Declined
            | BookingStatus::Canceled
            | BookingStatus::Expired => true,
            BookingStatus::Requested
            | BookingStatus::Approved
            | BookingStatus::HandoverPending
            | BookingStatus::InUse
            | BookingStatus::ReturnPending => false,
        }
    }

    /// Edges of the booking state machine for the given deal type.
    ///
    /// Rent: `requested → approved → in_use (→ return_pending) → completed`.
    /// Buy/give: `requested → approved → handover_pending → completed`.
    /// Both: `requested → declined | canceled`, `approved → expired`.
    pub fn can_transition_to(self, next: BookingStatus, kind: BookingType) -> bool {
        use BookingStatus::*;
        let rent = !kind.is_transfer();
        match self {
            Requested => matches!(next, Approved | Declined | Canceled),
            Approved => match next {
                Expired => true,
                InUse => rent,
                HandoverPending => !rent,
                _ => false,
            },
            HandoverPending => next == Completed && !rent,
            InUse => rent && matches!(next, ReturnPending | Completed),
            ReturnPending => rent && next == Completed,
            Completed | Declined | Canceled | Expired => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Requested => "requested",
            BookingStatus::Approved => "approved",
            BookingStatus::HandoverPending => "handover_pending",
            BookingStatus::InUse => "in_use",
            BookingStatus::ReturnPending => "return_pending",
            BookingStatus::Completed => "completed",
            BookingStatus::Declined => "declined",
            BookingStatus::Canceled => "canceled",
            BookingStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Availability flag of an item, owned by the item collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Active,
    InUse,
    Archived,
    Deleted,
    Transferred,
}

impl ItemStatus {
    /// Archived, deleted and transferred items are never touched by the booking engine.
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Archived | ItemStatus::Deleted | ItemStatus::Transferred)
    }

    pub fn accepts_bookings(self) -> bool {
        matches!(self, ItemStatus::Active | ItemStatus::InUse)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Active => "active",
            ItemStatus::InUse => "in_use",
            ItemStatus::Archived => "archived",
            ItemStatus::Deleted => "deleted",
            ItemStatus::Transferred => "transferred",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a booking an actor is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Owner,
    Requester,
}

impl Party {
    pub fn as_str(self) -> &'static str {
        match self {
            Party::Owner => "owner",
            Party::Requester => "requester",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub item_id: Ulid,
    pub requester_id: Ulid,
    pub owner_id: Ulid,
    #[serde(rename = "type")]
    pub kind: BookingType,
    pub status: BookingStatus,
    /// Rent window; `None` for buy/give.
    pub span: Option<Span>,
    pub handover_deadline: Option<Ms>,
    pub handover_confirmed_by_owner: Option<Ms>,
    pub handover_confirmed_by_requester: Option<Ms>,
    pub return_confirmed_by_owner: Option<Ms>,
    pub return_confirmed_by_requester: Option<Ms>,
    pub created_at: Ms,
}

impl Booking {
    pub fn start(&self) -> Option<Ms> {
        self.span.map(|s| s.start)
    }

    pub fn end(&self) -> Option<Ms> {
        self.span.map(|s| s.end)
    }

    pub fn party(&self, actor: Ulid) -> Option<Party> {
        if actor == self.owner_id {
            Some(Party::Owner)
        } else if actor == self.requester_id {
            Some(Party::Requester)
        } else {
            None
        }
    }

    pub fn handover_confirmed_by(&self, party: Party) -> Option<Ms> {
        match party {
            Party::Owner => self.handover_confirmed_by_owner,
            Party::Requester => self.handover_confirmed_by_requester,
        }
    }

    pub fn return_confirmed_by(&self, party: Party) -> Option<Ms> {
        match party {
            Party::Owner => self.return_confirmed_by_owner,
            Party::Requester => self.return_confirmed_by_requester,
        }
    }

    /// Stamp the party's handover confirmation. Returns false if it was already set.
    pub fn confirm_handover(&mut self, party: Party, now: Ms) -> bool {
        let slot = match party {
            Party::Owner => &mut self.handover_confirmed_by_owner,
            Party::Requester => &mut self.handover_confirmed_by_requester,
        };
        stamp_once(slot, now)
    }

    /// Stamp the party's return confirmation. Returns false if it was already set.
    pub fn confirm_return(&mut self, party: Party, now: Ms) -> bool {
        let slot = match party {
            Party::Owner => &mut self.return_confirmed_by_owner,
            Party::Requester => &mut self.return_confirmed_by_requester,
        };
        stamp_once(slot, now)
    }

    pub fn handover_confirmed(&self) -> bool {
        self.handover_confirmed_by_owner.is_some() && self.handover_confirmed_by_requester.is_some()
    }

    pub fn return_confirmed(&self) -> bool {
        self.return_confirmed_by_owner.is_some() && self.return_confirmed_by_requester.is_some()
    }
}

fn stamp_once(slot: &mut Option<Ms>, now: Ms) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(now);
    true
}

/// One row of the audit trail. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingEvent {
    pub id: u64,
    pub booking_id: Ulid,
    /// `None` for system transitions (expiry).
    pub actor_user_id: Option<Ulid>,
    pub action: String,
    pub from_status: Option<BookingStatus>,
    pub to_status: Option<BookingStatus>,
    #[serde(with = "json_text")]
    pub meta: Option<serde_json::Value>,
    pub created_at: Ms,
}

/// Audit action tags.
pub mod action {
    pub const CREATE: &str = "create";
    pub const APPROVE: &str = "approve";
    pub const APPROVE_TRANSFER: &str = "approve_transfer";
    pub const AUTO_DECLINE_COMPETITOR: &str = "auto_decline_competitor";
    pub const AUTO_DECLINE_TRANSFER: &str = "auto_decline_transfer";
    pub const HANDOVER_CONFIRM: &str = "handover_confirm";
    pub const HANDOVER_TRANSFER_CONFIRM: &str = "handover_transfer_confirm";
    pub const COMPLETE_TRANSFER: &str = "complete_transfer";
    pub const RETURN_CONFIRM: &str = "return_confirm";
    pub const STATUS_CHANGE: &str = "status_change";
    pub const CANCEL: &str = "cancel";
    pub const EXPIRE: &str = "expire";
}

/// `meta` is free-form JSON; bincode can't carry `serde_json::Value` directly,
/// so it travels as JSON text.
mod json_text {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<serde_json::Value>, s: S) -> Result<S::Ok, S::Error> {
        value.as_ref().map(|v| v.to_string()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<serde_json::Value>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|text| serde_json::from_str(&text).map_err(D::Error::custom))
            .transpose()
    }
}

/// Everything the engine knows about one item: its owner and status, every booking
/// ever made on it, and their audit trail. This is the unit of locking.
#[derive(Debug, Clone)]
pub struct ItemState {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub status: ItemStatus,
    /// Bookings in creation order.
    pub bookings: Vec<Booking>,
    /// Audit events in append order.
    pub events: Vec<BookingEvent>,
    positions: HashMap<Ulid, usize>,
    /// Rent windows sorted by `start`.
    calendar: Vec<(Span, Ulid)>,
}

impl ItemState {
    pub fn new(id: Ulid, owner_id: Ulid, status: ItemStatus) -> Self {
        Self {
            id,
            owner_id,
            status,
            bookings: Vec::new(),
            events: Vec::new(),
            positions: HashMap::new(),
            calendar: Vec::new(),
        }
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.positions.get(id).map(|&pos| &self.bookings[pos])
    }

    /// Insert a new booking or replace the stored row with the same id. A row that
    /// would change who asked, what kind of deal it is, or its window is refused.
    pub fn upsert_booking(&mut self, booking: Booking) -> Upsert {
        if let Some(&pos) = self.positions.get(&booking.id) {
            let stored = &self.bookings[pos];
            if stored.requester_id != booking.requester_id
                || stored.kind != booking.kind
                || stored.span != booking.span
            {
                return Upsert::Rejected;
            }
            self.bookings[pos] = booking;
            return Upsert::Replaced;
        }
        if let Some(span) = booking.span {
            let at = self.calendar.partition_point(|(s, _)| s.start <= span.start);
            self.calendar.insert(at, (span, booking.id));
        }
        self.positions.insert(booking.id, self.bookings.len());
        self.bookings.push(booking);
        Upsert::Inserted
    }

    /// Rent bookings (any status) whose window overlaps `query`.
    /// Uses binary search to skip windows starting at or after `query.end`.
    pub fn overlapping_rentals<'a>(&'a self, query: &Span) -> impl Iterator<Item = &'a Booking> + 'a {
        let query = *query;
        let right_bound = self.calendar.partition_point(|(s, _)| s.start < query.end);
        self.calendar[..right_bound]
            .iter()
            .filter(move |(s, _)| s.end > query.start)
            .filter_map(move |(_, id)| self.booking(id))
    }

    pub fn events_for<'a>(&'a self, booking_id: Ulid) -> impl Iterator<Item = &'a BookingEvent> + 'a {
        self.events.iter().filter(move |e| e.booking_id == booking_id)
    }

    pub fn info(&self) -> ItemInfo {
        ItemInfo {
            id: self.id,
            owner_id: self.owner_id,
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
    /// Same id, different booking.
    Rejected,
}

/// One atomic unit of change on a single item. Committed as one WAL record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Txn {
    pub item_id: Ulid,
    /// Full rows for every booking created or changed.
    pub bookings: Vec<Booking>,
    pub events: Vec<BookingEvent>,
    pub item_status: Option<ItemStatus>,
}

impl Txn {
    pub fn new(item_id: Ulid) -> Self {
        Self {
            item_id,
            bookings: Vec::new(),
            events: Vec::new(),
            item_status: None,
        }
    }
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    ItemRegistered {
        id: Ulid,
        owner_id: Ulid,
        status: ItemStatus,
    },
    ItemStatusSet {
        id: Ulid,
        status: ItemStatus,
    },
    Committed(Txn),
}

impl Record {
    pub fn item_id(&self) -> Ulid {
        match self {
            Record::ItemRegistered { id, .. } | Record::ItemStatusSet { id, .. } => *id,
            Record::Committed(txn) => txn.item_id,
        }
    }
}

// ── Request / query types ────────────────────────────────────────

/// A booking request as received from the caller. Shape is validated by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub item_id: Ulid,
    pub requester_id: Ulid,
    pub kind: BookingType,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl NewBooking {
    pub fn rent(item_id: Ulid, requester_id: Ulid, start: Ms, end: Ms) -> Self {
        Self {
            id: Ulid::new(),
            item_id,
            requester_id,
            kind: BookingType::Rent,
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn transfer(item_id: Ulid, requester_id: Ulid, kind: BookingType) -> Self {
        Self {
            id: Ulid::new(),
            item_id,
            requester_id,
            kind,
            start: None,
            end: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Page {
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: Some(limit),
            offset,
        }
    }

    /// Effective limit: `default` when unset or zero, capped at `max`.
    pub fn limit_or(&self, default: usize, max: usize) -> usize {
        match self.limit {
            None | Some(0) => default,
            Some(n) => n.min(max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFilter {
    pub actor_user_id: Option<Ulid>,
    pub booking_id: Option<Ulid>,
    pub item_id: Option<Ulid>,
    pub page: Page,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemInfo {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    pub booking: Booking,
    /// Competitors moved to `declined` by this approval.
    pub declined: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upcoming {
    pub current: Option<Booking>,
    pub upcoming: Vec<Booking>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyDays {
    /// Blocking rent windows clamped to the query window, ascending by start.
    pub busy: Vec<Span>,
    pub in_use_now: bool,
}
