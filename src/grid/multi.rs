use std::sync::Arc;

use chrono::{Days, NaiveDate};
use tracing::debug;

use super::{
    Availability, Columns, GridFrame, Schedule, ScheduleGrid, day_minutes, round_mins,
};
use crate::limits::MINUTES_PER_DAY;
use crate::model::{MINUTE_MS, Ms, ResourceRules, ScheduleEvent, Span, day_start};

/// Many resources over one day, slots indexed by minute-of-day.
///
/// All columns share the earliest start, the latest end and the finest slot
/// size of the resources. Double-bookings are moved to virtual columns.
#[derive(Debug, Clone)]
pub struct MultiScheduleGrid {
    date: NaiveDate,
    start_mins: u32,
    end_mins: u32,
    slot_size: u32,
    columns: Columns,
}

impl MultiScheduleGrid {
    /// An empty grid. Rules that fail [`ResourceRules::is_valid`] get no
    /// column and do not shape the frame.
    pub fn new(date: NaiveDate, resources: &[ResourceRules]) -> Self {
        let valid = || resources.iter().filter(|r| r.is_valid());
        let slot_size = valid().map(|r| r.slot_size).min().unwrap_or(15);
        let start_mins = valid().map(|r| r.start_mins).min().unwrap_or(0);
        let end_mins = valid()
            .map(|r| r.end_mins)
            .max()
            .unwrap_or(MINUTES_PER_DAY);
        Self {
            date,
            start_mins: round_mins(start_mins, slot_size, false),
            end_mins: round_mins(end_mins, slot_size, true),
            slot_size,
            columns: Columns::new(resources, slot_size),
        }
    }

    pub fn build(
        date: NaiveDate,
        resources: &[ResourceRules],
        events: impl IntoIterator<Item = ScheduleEvent>,
    ) -> Self {
        let mut grid = Self::new(date, resources);
        let mut events: Vec<ScheduleEvent> = events.into_iter().collect();
        events.sort_by_key(|e| (e.span.start, e.span.end));
        for event in events {
            grid.add_event(event);
        }
        grid
    }

    fn day(&self) -> Span {
        let midnight = day_start(self.date);
        Span::new(midnight, midnight + MINUTES_PER_DAY as Ms * MINUTE_MS)
    }

    /// Place an event, widening the bounds to cover it. Returns its column,
    /// `None` when it is off this day or for an unknown resource.
    pub fn add_event(&mut self, event: ScheduleEvent) -> Option<usize> {
        if !event.span.overlaps(&self.day()) {
            debug!(event_id = %event.id, "event off the grid day, skipped");
            return None;
        }
        if self.columns.knows(event.resource_id) && event.span.start < event.span.end {
            let (start, end) = day_minutes(&event.span, self.date, self.slot_size);
            self.start_mins = self.start_mins.min(start);
            self.end_mins = self.end_mins.max(end);
        }
        self.columns.place(Arc::new(event))
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn columns(&self) -> &[Schedule] {
        self.columns.as_slice()
    }

    /// Minute-of-day the slot begins.
    pub fn slot_minutes(&self, slot: usize) -> u32 {
        self.start_mins + slot as u32 * self.slot_size
    }

    fn slot_window(&self, slot: usize) -> Option<Span> {
        (slot < self.slot_count()).then(|| {
            let start = day_start(self.date) + self.slot_minutes(slot) as Ms * MINUTE_MS;
            Span::new(start, start + self.slot_size as Ms * MINUTE_MS)
        })
    }
}

impl ScheduleGrid for MultiScheduleGrid {
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
        self.columns.len()
    }

    fn resource_at(&self, col: usize) -> Option<&Schedule> {
        self.columns.get(col)
    }

    fn slot_count(&self) -> usize {
        ((self.end_mins - self.start_mins) / self.slot_size) as usize
    }

    fn slot_start(&self, slot: usize) -> Option<Ms> {
        self.slot_window(slot).map(|w| w.start)
    }

    fn event_at(&self, col: usize, slot: usize) -> Option<&Arc<ScheduleEvent>> {
        let window = self.slot_window(slot)?;
        self.columns.get(col)?.event_in(&window)
    }

    fn slots_occupied_by(&self, event: &ScheduleEvent, col: usize, slot: usize) -> usize {
        match self.event_at(col, slot) {
            Some(e) if e.id == event.id => {
                let (_, end) = day_minutes(&event.span, self.date, self.slot_size);
                let end = end.min(self.end_mins);
                end.saturating_sub(self.slot_minutes(slot))
                    .div_ceil(self.slot_size)
                    .max(1) as usize
            }
            _ => 0,
        }
    }

    fn availability_at(&self, col: usize, slot: usize) -> Availability {
        let Some(column) = self.columns.get(col) else {
            return Availability::Unavailable;
        };
        if slot >= self.slot_count() {
            return Availability::Unavailable;
        }
        if self.event_at(col, slot).is_some() {
            Availability::Busy
        } else if column.is_open_at(self.slot_minutes(slot)) {
            Availability::Free
        } else {
            Availability::Unavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::to_ms;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use ulid::Ulid;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn at(h: u32, m: u32) -> Ms {
        to_ms(date().and_hms_opt(h, m, 0).unwrap())
    }

    fn resource(start: u32, end: u32, slot: u32) -> ResourceRules {
        ResourceRules::new(Ulid::new(), None, start, end, slot, false).unwrap()
    }

    fn appt(r: &ResourceRules, start: Ms, end: Ms) -> ScheduleEvent {
        ScheduleEvent::appointment(Ulid::new(), r.id, Span::new(start, end))
    }

    fn block(r: &ResourceRules, start: Ms, end: Ms) -> ScheduleEvent {
        ScheduleEvent::block(Ulid::new(), r.id, Span::new(start, end), BTreeSet::new())
    }

    fn column_ids(grid: &MultiScheduleGrid) -> Vec<(Ulid, Option<usize>)> {
        grid.columns()
            .iter()
            .map(|c| (c.resource_id(), c.origin()))
            .collect()
    }

    #[test]
    fn frame_is_the_union_of_resources() {
        let a = resource(8 * 60, 12 * 60, 30);
        let b = resource(9 * 60, 17 * 60, 15);
        let grid = MultiScheduleGrid::new(date(), &[a, b]);
        let frame = grid.frame();
        assert_eq!((frame.start_mins, frame.end_mins, frame.slot_size), (480, 1020, 15));
        assert_eq!(grid.slot_count(), 36);
        assert_eq!(grid.availability_at(0, 0), Availability::Free);
        assert_eq!(grid.availability_at(1, 0), Availability::Unavailable);
        assert_eq!(grid.availability_at(0, 20), Availability::Unavailable);
    }

    #[test]
    fn double_booking_opens_one_virtual_column_after_its_origin() {
        let a = resource(540, 1020, 15);
        let b = resource(540, 1020, 15);
        let first = appt(&a, at(9, 0), at(9, 30));
        let second = appt(&a, at(9, 15), at(9, 45));
        let grid = MultiScheduleGrid::build(
            date(),
            &[a.clone(), b.clone()],
            vec![first.clone(), second.clone()],
        );

        assert_eq!(
            column_ids(&grid),
            vec![(a.id, None), (a.id, Some(0)), (b.id, None)]
        );
        assert_eq!(grid.event_at(0, 0).map(|e| e.id), Some(first.id));
        assert_eq!(grid.event_at(1, 1).map(|e| e.id), Some(second.id));
        assert_eq!(grid.slots_occupied_by(&second, 1, 1), 2);
        assert_eq!(grid.availability_at(1, 0), Availability::Free);
    }

    #[test]
    fn later_overlaps_reuse_virtual_columns() {
        let a = resource(540, 1020, 15);
        let events = vec![
            appt(&a, at(9, 0), at(10, 0)),
            appt(&a, at(9, 0), at(9, 30)),
            appt(&a, at(9, 30), at(10, 0)),
            appt(&a, at(9, 45), at(10, 15)),
        ];
        let grid = MultiScheduleGrid::build(date(), &[a.clone()], events.clone());

        assert_eq!(grid.column_count(), 3);
        assert_eq!(grid.columns()[0].non_blocking().len(), 2);
        assert_eq!(grid.columns()[2].origin(), Some(0));
        for e in &events {
            let found = (0..grid.column_count())
                .any(|col| (0..grid.slot_count()).any(|s| grid.event_at(col, s).is_some_and(|x| x.id == e.id)));
            assert!(found, "event {} not discoverable", e.id);
        }
    }

    #[test]
    fn blocks_are_shared_by_the_group() {
        let a = resource(540, 1020, 15);
        let lunch = block(&a, at(12, 0), at(13, 0));
        let events = vec![
            lunch.clone(),
            appt(&a, at(9, 0), at(9, 30)),
            appt(&a, at(9, 0), at(9, 30)),
        ];
        let mut grid = MultiScheduleGrid::build(date(), &[a.clone()], events);

        assert_eq!(grid.column_count(), 2);
        let noon = ((12 * 60 - 540) / 15) as usize;
        for col in 0..2 {
            assert_eq!(grid.event_at(col, noon).map(|e| e.id), Some(lunch.id));
            assert_eq!(grid.availability_at(col, noon), Availability::Busy);
        }
        // Blocks overlapping appointments never open a column
        assert_eq!(grid.add_event(block(&a, at(9, 0), at(10, 0))), Some(0));
        assert_eq!(grid.column_count(), 2);
    }

    #[test]
    fn bounds_never_shrink() {
        let a = resource(540, 720, 30);
        let mut grid = MultiScheduleGrid::new(date(), &[a.clone()]);
        grid.add_event(appt(&a, at(7, 10), at(7, 40)));
        assert_eq!(grid.frame().start_mins, 420);
        grid.add_event(appt(&a, at(13, 0), at(14, 0)));
        grid.add_event(appt(&a, at(10, 0), at(10, 30)));
        let frame = grid.frame();
        assert_eq!((frame.start_mins, frame.end_mins), (420, 840));
    }

    #[test]
    fn unknown_resources_and_other_days_are_skipped() {
        let a = resource(540, 720, 30);
        let stranger = resource(540, 720, 30);
        let mut grid = MultiScheduleGrid::new(date(), &[a.clone()]);
        assert_eq!(grid.add_event(appt(&stranger, at(9, 0), at(9, 30))), None);
        assert_eq!(
            grid.add_event(appt(&a, at(9, 0) + 24 * 60 * MINUTE_MS, at(10, 0) + 24 * 60 * MINUTE_MS)),
            None
        );
        assert_eq!(grid.column_count(), 1);
        assert_eq!(grid.frame().end_mins, 720);
    }

    #[test]
    fn invalid_rules_get_no_column() {
        let a = resource(540, 720, 30);
        let mut broken = resource(480, 1020, 15);
        broken.slot_size = 0;
        let mut inverted = resource(540, 720, 30);
        inverted.start_mins = 800;
        let grid = MultiScheduleGrid::build(
            date(),
            &[broken.clone(), a.clone(), inverted],
            vec![appt(&broken, at(9, 0), at(9, 30)), appt(&a, at(9, 0), at(9, 30))],
        );
        let frame = grid.frame();
        assert_eq!((frame.start_mins, frame.end_mins, frame.slot_size), (540, 720, 30));
        assert_eq!(column_ids(&grid), vec![(a.id, None)]);
        assert_eq!(grid.availability_at(0, 0), Availability::Busy);
    }
}
