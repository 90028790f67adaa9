//! Slotted layouts of events for rendering.
//!
//! Every grid is a read-only set of columns, one per resource plus any
//! virtual columns opened to hold double-bookings, crossed with a run of
//! slots. Rendering code only ever sees the [`ScheduleGrid`] trait.

mod multi;
mod multi_day;
mod schedule;
mod single;

pub use multi::MultiScheduleGrid;
pub use multi_day::MultiDayGrid;
pub use schedule::Schedule;
pub use single::{SingleScheduleGrid, Slot, SlotGroup};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;
use ulid::Ulid;

use crate::limits::MINUTES_PER_DAY;
use crate::model::{MINUTE_MS, Ms, ResourceRules, ScheduleEvent, Span, date_of, day_start};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Free,
    Busy,
    Unavailable,
}

/// Bounds of a grid. `end` is exclusive; minutes are from midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GridFrame {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub start_mins: u32,
    pub end_mins: u32,
    pub slot_size: u32,
}

pub trait ScheduleGrid {
    fn frame(&self) -> GridFrame;

    fn column_count(&self) -> usize;

    fn resource_at(&self, col: usize) -> Option<&Schedule>;

    fn slot_count(&self) -> usize;

    /// Instant the slot begins.
    fn slot_start(&self, slot: usize) -> Option<Ms>;

    fn event_at(&self, col: usize, slot: usize) -> Option<&Arc<ScheduleEvent>>;

    /// Slots `event` covers from `slot` onwards, `0` if it does not sit there.
    fn slots_occupied_by(&self, event: &ScheduleEvent, col: usize, slot: usize) -> usize;

    fn availability_at(&self, col: usize, slot: usize) -> Availability;
}

// ── Slot arithmetic ──────────────────────────────────────────────

/// `t` rounded down to a multiple of `cell_mins` counted from its midnight.
pub(crate) fn align_down(t: Ms, cell_mins: u32) -> Ms {
    let midnight = day_start(date_of(t));
    let cell = cell_mins as Ms * MINUTE_MS;
    midnight + (t - midnight) / cell * cell
}

/// `t` rounded up to a multiple of `cell_mins` counted from its midnight.
pub(crate) fn align_up(t: Ms, cell_mins: u32) -> Ms {
    let down = align_down(t, cell_mins);
    if down == t {
        t
    } else {
        (down + cell_mins as Ms * MINUTE_MS).min(day_start(date_of(t)) + 24 * 60 * MINUTE_MS)
    }
}

/// The event's minute range on `date`, slot-aligned, clipped to 0 and 1440
/// where it runs over midnight.
pub(crate) fn day_minutes(span: &Span, date: NaiveDate, slot_size: u32) -> (u32, u32) {
    let midnight = day_start(date);
    let start = if span.start <= midnight {
        0
    } else {
        (((align_down(span.start, slot_size) - midnight) / MINUTE_MS) as u32).min(MINUTES_PER_DAY)
    };
    let next_midnight = midnight + MINUTES_PER_DAY as Ms * MINUTE_MS;
    let end = if span.end >= next_midnight {
        MINUTES_PER_DAY
    } else {
        (((align_up(span.end, slot_size) - midnight) / MINUTE_MS) as u32).min(MINUTES_PER_DAY)
    };
    (start, end)
}

/// Round `mins` down (or up) to a multiple of `slot_size`.
pub(crate) fn round_mins(mins: u32, slot_size: u32, up: bool) -> u32 {
    let down = mins / slot_size * slot_size;
    if up && down != mins {
        (down + slot_size).min(MINUTES_PER_DAY)
    } else {
        down
    }
}

// ── Columns ──────────────────────────────────────────────────────

/// Resource columns plus the virtual columns cloned from them. Each group
/// (an original and its clones) is kept contiguous.
#[derive(Debug, Clone, Default)]
pub(crate) struct Columns {
    columns: Vec<Schedule>,
    groups: HashMap<Ulid, usize>,
}

impl Columns {
    pub(crate) fn new(rules: &[ResourceRules], cell_mins: u32) -> Self {
        let mut columns = Columns::default();
        for r in rules {
            if !r.is_valid() {
                warn!(resource_id = %r.id, "invalid resource rules, column skipped");
                continue;
            }
            if columns.groups.contains_key(&r.id) {
                continue;
            }
            let group = columns.groups.len();
            columns.groups.insert(r.id, group);
            columns.columns.push(Schedule::new(r.clone(), group, cell_mins));
        }
        columns
    }

    pub(crate) fn get(&self, col: usize) -> Option<&Schedule> {
        self.columns.get(col)
    }

    pub(crate) fn len(&self) -> usize {
        self.columns.len()
    }

    pub(crate) fn as_slice(&self) -> &[Schedule] {
        &self.columns
    }

    pub(crate) fn knows(&self, resource_id: Ulid) -> bool {
        self.groups.contains_key(&resource_id)
    }

    /// Add `event` to its resource's group. Blocks go to every column of the
    /// group; an appointment goes to the first column it fits, or to a new
    /// virtual column after the group. Returns the column, `None` if the
    /// resource is not on the grid.
    pub(crate) fn place(&mut self, event: Arc<ScheduleEvent>) -> Option<usize> {
        if event.span.start >= event.span.end {
            warn!(event_id = %event.id, "event with an empty span, skipped");
            return None;
        }
        let Some(&group) = self.groups.get(&event.resource_id) else {
            warn!(event_id = %event.id, resource_id = %event.resource_id, "event for a resource not on the grid, skipped");
            return None;
        };
        let first = self.columns.iter().position(|c| c.group() == group)?;
        let last = first
            + self.columns[first..]
                .iter()
                .take_while(|c| c.group() == group)
                .count()
            - 1;

        if event.is_blocking() {
            for col in &mut self.columns[first..=last] {
                col.add_event(&event);
            }
            return Some(first);
        }
        for col in first..=last {
            if self.columns[col].add_event(&event) {
                return Some(col);
            }
        }
        let mut column = self.columns[first].clone_virtual();
        column.add_event(&event);
        self.columns.insert(last + 1, column);
        Some(last + 1)
    }
}
