use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::limits::MINUTES_PER_DAY;

/// Unix milliseconds, read as the practice's wall clock.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Values that cannot describe a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("span must have positive length, got {start}..{end}")]
    EmptySpan { start: Ms, end: Ms },
    #[error("invalid rules for resource {0}: need 0 <= start < end <= 1440 and a positive slot size")]
    InvalidRules(Ulid),
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SpanFields")]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

#[derive(Deserialize)]
struct SpanFields {
    start: Ms,
    end: Ms,
}

impl TryFrom<SpanFields> for Span {
    type Error = ModelError;

    fn try_from(f: SpanFields) -> Result<Self, ModelError> {
        Span::try_new(f.start, f.end).ok_or(ModelError::EmptySpan {
            start: f.start,
            end: f.end,
        })
    }
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for spans arriving from outside the crate.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
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

    /// Same duration, moved to start at `start`.
    pub fn moved_to(&self, start: Ms) -> Span {
        Span::new(start, start + self.duration_ms())
    }
}

// ── Calendar helpers ─────────────────────────────────────────────

/// Wall clock now.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

pub fn to_datetime(t: Ms) -> NaiveDateTime {
    DateTime::from_timestamp_millis(t)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

pub fn to_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

pub fn date_of(t: Ms) -> NaiveDate {
    to_datetime(t).date()
}

/// Midnight at the start of `date`.
pub fn day_start(date: NaiveDate) -> Ms {
    to_ms(date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

pub fn minute_of_day(t: Ms) -> u32 {
    let dt = to_datetime(t);
    dt.hour() * 60 + dt.minute()
}

/// Minute-of-day of `t` aligned to a slot boundary. Rounds down unless
/// `round_up` is set and `t` falls inside a slot.
pub fn slot_minutes(t: Ms, slot_size: u32, round_up: bool) -> u32 {
    let mins = minute_of_day(t);
    let mut result = (mins / slot_size) * slot_size;
    let exact = result == mins && t.rem_euclid(MINUTE_MS) == 0;
    if round_up && !exact {
        result += slot_size;
    }
    result.min(MINUTES_PER_DAY)
}

// ── Events ───────────────────────────────────────────────────────

/// A party requesting a booking, with the classifications (customer
/// account types and the like) that reserved blocks are checked against.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Party {
    pub id: Ulid,
    pub classifications: BTreeSet<String>,
}

impl Party {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            classifications: BTreeSet::new(),
        }
    }

    pub fn with_classification(mut self, class: impl Into<String>) -> Self {
        self.classifications.insert(class.into());
        self
    }
}

/// What an event represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A real appointment.
    Appointment,
    /// A reservation or closure. A non-empty `allowed` set restricts the
    /// block to parties carrying one of those classifications.
    Block { allowed: BTreeSet<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub kind: EventKind,
    pub series_id: Option<Ulid>,
    pub party: Option<Ulid>,
    pub clinician: Option<Ulid>,
    pub event_type: Option<Ulid>,
    pub status: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl ScheduleEvent {
    pub fn appointment(id: Ulid, resource_id: Ulid, span: Span) -> Self {
        Self {
            id,
            resource_id,
            span,
            kind: EventKind::Appointment,
            series_id: None,
            party: None,
            clinician: None,
            event_type: None,
            status: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn block(id: Ulid, resource_id: Ulid, span: Span, allowed: BTreeSet<String>) -> Self {
        Self {
            kind: EventKind::Block { allowed },
            ..Self::appointment(id, resource_id, span)
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self.kind, EventKind::Block { .. })
    }

    /// A block is reserved against `party` when it names at least one
    /// allowed classification and the party holds none of them.
    pub fn is_reserved_against(&self, party: Option<&Party>) -> bool {
        match &self.kind {
            EventKind::Appointment => false,
            EventKind::Block { allowed } if allowed.is_empty() => false,
            EventKind::Block { allowed } => {
                party.is_none_or(|p| p.classifications.is_disjoint(allowed))
            }
        }
    }

    /// True if everything but identity, timing and series linkage matches.
    pub fn same_template(&self, other: &ScheduleEvent) -> bool {
        self.resource_id == other.resource_id
            && self.kind == other.kind
            && self.party == other.party
            && self.clinician == other.clinician
            && self.event_type == other.event_type
            && self.status == other.status
            && self.attributes == other.attributes
    }
}

// ── Resources ────────────────────────────────────────────────────

/// Per-resource rules supplied by the practice configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RulesFields")]
pub struct ResourceRules {
    pub id: Ulid,
    pub name: Option<String>,
    /// Operating window, minutes from midnight.
    pub start_mins: u32,
    pub end_mins: u32,
    pub slot_size: u32,
    pub allow_double_booking: bool,
}

impl ResourceRules {
    pub fn new(
        id: Ulid,
        name: Option<String>,
        start_mins: u32,
        end_mins: u32,
        slot_size: u32,
        allow_double_booking: bool,
    ) -> Option<Self> {
        let rules = Self {
            id,
            name,
            start_mins,
            end_mins,
            slot_size,
            allow_double_booking,
        };
        rules.is_valid().then_some(rules)
    }

    /// Whether slot arithmetic over these rules is well defined. Only
    /// values built field by field can fail this.
    pub fn is_valid(&self) -> bool {
        self.slot_size > 0 && self.start_mins < self.end_mins && self.end_mins <= MINUTES_PER_DAY
    }
}

#[derive(Deserialize)]
struct RulesFields {
    id: Ulid,
    #[serde(default)]
    name: Option<String>,
    start_mins: u32,
    end_mins: u32,
    slot_size: u32,
    #[serde(default)]
    allow_double_booking: bool,
}

impl TryFrom<RulesFields> for ResourceRules {
    type Error = ModelError;

    fn try_from(f: RulesFields) -> Result<Self, ModelError> {
        ResourceRules::new(f.id, f.name, f.start_mins, f.end_mins, f.slot_size, f.allow_double_booking)
            .ok_or(ModelError::InvalidRules(f.id))
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub rules: ResourceRules,
    /// All events (appointments and blocks), sorted by `span.start`.
    events: Vec<ScheduleEvent>,
    /// Longest span ever inserted. Never shrinks, so it stays an upper bound.
    longest: Ms,
}

impl ResourceState {
    pub fn new(rules: ResourceRules) -> Self {
        Self {
            rules,
            events: Vec::new(),
            longest: 0,
        }
    }

    pub fn id(&self) -> Ulid {
        self.rules.id
    }

    pub fn events(&self) -> &[ScheduleEvent] {
        &self.events
    }

    /// Insert event maintaining sort order by span.start.
    pub fn insert_event(&mut self, event: ScheduleEvent) {
        self.longest = self.longest.max(event.span.duration_ms());
        let pos = self
            .events
            .binary_search_by_key(&event.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.events.insert(pos, event);
    }

    /// Remove event by id.
    pub fn remove_event(&mut self, id: Ulid) -> Option<ScheduleEvent> {
        let pos = self.events.iter().position(|e| e.id == id)?;
        Some(self.events.remove(pos))
    }

    pub fn get_event(&self, id: Ulid) -> Option<&ScheduleEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    /// Events whose span overlaps the query window, in start order.
    ///
    /// Both ends are binary searched: nothing starting at or after
    /// `query.end` can overlap, and nothing starting at or before
    /// `query.start - longest` can reach it.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ScheduleEvent> {
        let horizon = query.start.saturating_sub(self.longest);
        let left = self.events.partition_point(|e| e.span.start <= horizon);
        let right = self.events.partition_point(|e| e.span.start < query.end);
        self.events[left..right.max(left)]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }
}

// ── Series and log records ───────────────────────────────────────

/// The persisted header of a recurring series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub id: Ulid,
    pub anchor_id: Ulid,
    pub resource_id: Ulid,
    /// Canonical 5-field text, `None` once the recurrence has been cleared
    /// but elapsed history is still linked.
    pub expression: Option<String>,
    pub start_time: Ms,
    pub max_instances: u32,
    pub until: Option<Ms>,
    /// Bumped on every write; guards concurrent reconciliation.
    pub version: u64,
}

/// Store mutations, flat with no nesting. Also the log record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    ResourceCreated(ResourceRules),
    ResourceUpdated(ResourceRules),
    EventCreated(ScheduleEvent),
    EventUpdated(ScheduleEvent),
    EventDeleted { id: Ulid, resource_id: Ulid },
    SeriesCreated(SeriesRecord),
    SeriesUpdated(SeriesRecord),
    SeriesDeleted { id: Ulid },
}

impl Mutation {
    pub fn label(&self) -> &'static str {
        match self {
            Mutation::ResourceCreated(_) => "resource_created",
            Mutation::ResourceUpdated(_) => "resource_updated",
            Mutation::EventCreated(_) => "event_created",
            Mutation::EventUpdated(_) => "event_updated",
            Mutation::EventDeleted { .. } => "event_deleted",
            Mutation::SeriesCreated(_) => "series_created",
            Mutation::SeriesUpdated(_) => "series_updated",
            Mutation::SeriesDeleted { .. } => "series_deleted",
        }
    }
}

/// The unit the store applies all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Batch {
    pub mutations: Vec<Mutation>,
    /// Optimistic guard: the series must still be at this version
    /// (`0` meaning "must not exist yet").
    pub expect: Option<(Ulid, u64)>,
}

impl Batch {
    pub fn single(mutation: Mutation) -> Self {
        Self {
            mutations: vec![mutation],
            expect: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }
}
