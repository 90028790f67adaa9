use std::sync::Arc;

use chrono::{Days, NaiveDate, Timelike};
use tracing::warn;

use super::{Availability, Columns, GridFrame, Schedule, ScheduleGrid};
use crate::limits::{MAX_GRID_DAYS, MINUTES_PER_DAY};
use crate::model::{DAY_MS, Ms, ResourceRules, ScheduleEvent, Span, date_of, day_start, to_datetime};

/// Many resources over a run of days; slot `n` is day `start + n`.
#[derive(Debug, Clone)]
pub struct MultiDayGrid {
    start: NaiveDate,
    days: u32,
    columns: Columns,
}

impl MultiDayGrid {
    pub fn new(start: NaiveDate, days: u32, resources: &[ResourceRules]) -> Self {
        let days = if days > MAX_GRID_DAYS {
            warn!(days, max = MAX_GRID_DAYS, "day grid too long, truncated");
            MAX_GRID_DAYS
        } else {
            days.max(1)
        };
        Self {
            start,
            days,
            columns: Columns::new(resources, MINUTES_PER_DAY),
        }
    }

    pub fn build(
        start: NaiveDate,
        days: u32,
        resources: &[ResourceRules],
        events: impl IntoIterator<Item = ScheduleEvent>,
    ) -> Self {
        let mut grid = Self::new(start, days, resources);
        let mut events: Vec<ScheduleEvent> = events.into_iter().collect();
        events.sort_by_key(|e| (e.span.start, e.span.end));
        for event in events {
            grid.add_event(event);
        }
        grid
    }

    fn end(&self) -> NaiveDate {
        self.start + Days::new(self.days as u64)
    }

    /// Day offset of `date` from the grid start (negative before it).
    fn offset(&self, date: NaiveDate) -> i64 {
        (date - self.start).num_days()
    }

    /// Place an event, widening the date range to cover it unless that would
    /// exceed the day cap. Returns its column.
    pub fn add_event(&mut self, event: ScheduleEvent) -> Option<usize> {
        if self.columns.knows(event.resource_id) && event.span.start < event.span.end {
            let first = date_of(event.span.start);
            let last = date_of(event.span.end - 1);
            let start = first.min(self.start);
            let end = (last + Days::new(1)).max(self.end());
            let days = (end - start).num_days();
            if days > MAX_GRID_DAYS as i64 {
                warn!(event_id = %event.id, "event outside the day grid cap, skipped");
                return None;
            }
            self.start = start;
            self.days = days as u32;
        }
        self.columns.place(Arc::new(event))
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start
    }

    pub fn days(&self) -> u32 {
        self.days
    }

    pub fn columns(&self) -> &[Schedule] {
        self.columns.as_slice()
    }

    fn day_window(&self, slot: usize) -> Option<Span> {
        (slot < self.days as usize).then(|| {
            let start = day_start(self.start + Days::new(slot as u64));
            Span::new(start, start + DAY_MS)
        })
    }
}

impl ScheduleGrid for MultiDayGrid {
    fn frame(&self) -> GridFrame {
        GridFrame {
            start: self.start,
            end: self.end(),
            start_mins: 0,
            end_mins: MINUTES_PER_DAY,
            slot_size: MINUTES_PER_DAY,
        }
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn resource_at(&self, col: usize) -> Option<&Schedule> {
        self.columns.get(col)
    }

    fn slot_count(&self) -> usize {
        self.days as usize
    }

    fn slot_start(&self, slot: usize) -> Option<Ms> {
        self.day_window(slot).map(|w| w.start)
    }

    fn event_at(&self, col: usize, slot: usize) -> Option<&Arc<ScheduleEvent>> {
        let window = self.day_window(slot)?;
        self.columns.get(col)?.event_in(&window)
    }

    /// Day columns the event spans from `slot`: the end date's offset, plus
    /// one when the end has a time of day.
    fn slots_occupied_by(&self, event: &ScheduleEvent, col: usize, slot: usize) -> usize {
        if !self.event_at(col, slot).is_some_and(|e| e.id == event.id) {
            return 0;
        }
        let end = to_datetime(event.span.end);
        let mut end_offset = self.offset(end.date());
        if end.num_seconds_from_midnight() > 0 || end.nanosecond() > 0 {
            end_offset += 1;
        }
        let end_offset = end_offset.clamp(0, self.days as i64) as usize;
        end_offset.saturating_sub(slot).max(1)
    }

    fn availability_at(&self, col: usize, slot: usize) -> Availability {
        if col >= self.columns.len() || slot >= self.days as usize {
            Availability::Unavailable
        } else if self.event_at(col, slot).is_some() {
            Availability::Busy
        } else {
            Availability::Free
        }
    }
}
