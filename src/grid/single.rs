use std::sync::Arc;

use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::warn;

use super::{Availability, GridFrame, Schedule, ScheduleGrid, day_minutes, round_mins};
use crate::limits::MINUTES_PER_DAY;
use crate::model::{MINUTE_MS, ModelError, Ms, ResourceRules, ScheduleEvent, Span, day_start};

/// A slot of the single-resource layout. `start_mins` is the label shown;
/// stacked double-bookings repeat labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub start_mins: u32,
    /// Index into the grid's slot groups.
    pub group: Option<usize>,
}

/// A contiguous run of slots attributed to one event.
#[derive(Debug, Clone)]
pub struct SlotGroup {
    pub start_slot: usize,
    pub slot_count: usize,
    pub event: Arc<ScheduleEvent>,
}

/// One resource over one day, every event in its own run of slots.
///
/// Events are laid out in start order. An event that begins before the
/// previous run has finished is stacked directly after it rather than
/// beside it, so its slots appear later than its nominal time.
#[derive(Debug, Clone)]
pub struct SingleScheduleGrid {
    date: NaiveDate,
    start_mins: u32,
    end_mins: u32,
    slot_size: u32,
    column: Schedule,
    slots: Vec<Slot>,
    groups: Vec<SlotGroup>,
}

impl SingleScheduleGrid {
    /// Lay out `events` for `rules` on `date`. Events of other resources
    /// and events with empty spans are skipped.
    pub fn new(
        date: NaiveDate,
        rules: ResourceRules,
        events: impl IntoIterator<Item = ScheduleEvent>,
    ) -> Result<Self, ModelError> {
        if !rules.is_valid() {
            return Err(ModelError::InvalidRules(rules.id));
        }
        let slot_size = rules.slot_size;
        let midnight = day_start(date);
        let day = Span::new(midnight, midnight + MINUTES_PER_DAY as Ms * MINUTE_MS);

        let mut events: Vec<Arc<ScheduleEvent>> = events
            .into_iter()
            .filter(|e| {
                if e.resource_id != rules.id {
                    warn!(event_id = %e.id, resource_id = %e.resource_id, "event for another resource, skipped");
                    return false;
                }
                if e.span.start >= e.span.end {
                    warn!(event_id = %e.id, "event with an empty span, skipped");
                    return false;
                }
                e.span.overlaps(&day)
            })
            .map(Arc::new)
            .collect();
        events.sort_by_key(|e| (e.span.start, e.span.end));

        let mut start_mins = round_mins(rules.start_mins, slot_size, false);
        let mut end_mins = round_mins(rules.end_mins, slot_size, true);
        let minutes: Vec<(u32, u32)> = events
            .iter()
            .map(|e| day_minutes(&e.span, date, slot_size))
            .collect();
        for &(s, e) in &minutes {
            start_mins = start_mins.min(s);
            end_mins = end_mins.max(e);
        }

        let mut grid = Self {
            date,
            start_mins,
            end_mins,
            slot_size,
            column: Schedule::new(rules, 0, slot_size),
            slots: Vec::new(),
            groups: Vec::new(),
        };
        grid.lay_out(events, &minutes);
        Ok(grid)
    }

    fn lay_out(&mut self, events: Vec<Arc<ScheduleEvent>>, minutes: &[(u32, u32)]) {
        let mut mins = self.start_mins;
        for (event, &(start, end)) in events.into_iter().zip(minutes) {
            if mins < start {
                while mins < start {
                    self.push_slot(&mut mins, None);
                }
            } else {
                mins = start;
            }
            let count = ((end - start).div_ceil(self.slot_size)).max(1) as usize;
            let group = self.groups.len();
            self.groups.push(SlotGroup {
                start_slot: self.slots.len(),
                slot_count: count,
                event,
            });
            for _ in 0..count {
                self.push_slot(&mut mins, Some(group));
            }
        }
        while mins < self.end_mins {
            self.push_slot(&mut mins, None);
        }
    }

    fn push_slot(&mut self, mins: &mut u32, group: Option<usize>) {
        self.slots.push(Slot {
            start_mins: *mins,
            group,
        });
        *mins += self.slot_size;
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn groups(&self) -> &[SlotGroup] {
        &self.groups
    }

    /// First slot whose label covers `minutes`.
    pub fn first_slot(&self, minutes: u32) -> Option<usize> {
        self.slots.iter().position(|s| self.covers(s, minutes))
    }

    /// Last slot whose label covers `minutes`.
    pub fn last_slot(&self, minutes: u32) -> Option<usize> {
        self.slots.iter().rposition(|s| self.covers(s, minutes))
    }

    fn covers(&self, slot: &Slot, minutes: u32) -> bool {
        slot.start_mins <= minutes && minutes < slot.start_mins + self.slot_size
    }

    fn group_at(&self, slot: usize) -> Option<&SlotGroup> {
        self.slots
            .get(slot)
            .and_then(|s| s.group)
            .and_then(|g| self.groups.get(g))
    }
}

impl ScheduleGrid for SingleScheduleGrid {
    fn frame(&self) -> GridFrame {
        GridFrame {
            start: self.date,
            end: self.date + Days::new(1),
            start_mins: self.start_mins,
            end_mins: self.end_mins,
            slot_size: self.slot_size,
        }
    }

    fn column_count(&self) -> usize {
        1
    }

    fn resource_at(&self, col: usize) -> Option<&Schedule> {
        (col == 0).then_some(&self.column)
    }

    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot_start(&self, slot: usize) -> Option<Ms> {
        self.slots
            .get(slot)
            .map(|s| day_start(self.date) + s.start_mins as Ms * MINUTE_MS)
    }

    fn event_at(&self, col: usize, slot: usize) -> Option<&Arc<ScheduleEvent>> {
        if col != 0 {
            return None;
        }
        self.group_at(slot).map(|g| &g.event)
    }

    fn slots_occupied_by(&self, event: &ScheduleEvent, col: usize, slot: usize) -> usize {
        match self.group_at(slot) {
            Some(g) if col == 0 && g.event.id == event.id => g.start_slot + g.slot_count - slot,
            _ => 0,
        }
    }

    fn availability_at(&self, col: usize, slot: usize) -> Availability {
        let Some(s) = self.slots.get(slot).filter(|_| col == 0) else {
            return Availability::Unavailable;
        };
        if s.group.is_some() {
            Availability::Busy
        } else if self.column.is_open_at(s.start_mins) {
            Availability::Free
        } else {
            Availability::Unavailable
        }
    }
}
