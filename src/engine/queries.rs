use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::grid::{MultiDayGrid, MultiScheduleGrid, SingleScheduleGrid};
use crate::limits::*;
use crate::model::*;
use crate::series::Series;

use super::conflict::{ConflictReport, check_overlaps, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// All resources, ordered by name then id.
    pub fn list_resources(&self) -> Vec<ResourceRules> {
        let mut rules: Vec<ResourceRules> = self
            .store
            .resource_ids()
            .into_iter()
            .filter_map(|id| self.store.get_rules(id))
            .collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        rules
    }

    pub fn get_event(&self, id: Ulid) -> Result<ScheduleEvent, EngineError> {
        self.store.get_event(id).ok_or(EngineError::NotFound(id))
    }

    /// Events of the resource overlapping `span`, in start order.
    pub fn events_in(&self, resource_id: Ulid, span: &Span) -> Result<Vec<ScheduleEvent>, EngineError> {
        validate_span(span)?;
        self.rules(resource_id)?;
        Ok(self.store.get_events_for(resource_id, span))
    }

    /// The series `event_id` belongs to, or a fresh one sized from the
    /// configuration if it is unlinked.
    pub fn load_series(&self, event_id: Ulid) -> Result<Series, EngineError> {
        let mut series = Series::load(self, event_id)?;
        if series.record().is_none() {
            series.set_max_instances(self.config.max_instances)?;
        }
        Ok(series)
    }

    /// Check candidates against the existing events of their resources
    /// without writing anything. Candidates may span several resources.
    pub fn check_overlaps(
        &self,
        candidates: &[ScheduleEvent],
        party: Option<&Party>,
    ) -> Result<ConflictReport, EngineError> {
        let max_overlaps = self.config.max_overlaps;
        let mut by_resource: BTreeMap<Ulid, Vec<ScheduleEvent>> = BTreeMap::new();
        for candidate in candidates {
            validate_span(&candidate.span)?;
            by_resource
                .entry(candidate.resource_id)
                .or_default()
                .push(candidate.clone());
        }

        let mut merged = ConflictReport {
            double_booking_allowed: true,
            max_overlaps,
            ..ConflictReport::default()
        };
        for (resource_id, events) in by_resource {
            let report = self
                .store
                .with_resource(resource_id, |rs| check_overlaps(&events, rs, party, max_overlaps))
                .ok_or(EngineError::NotFound(resource_id))?;
            merged.merge(report);
        }
        metrics::counter!(crate::observability::OVERLAP_CHECKS_TOTAL, "verdict" => merged.verdict().label())
            .increment(1);
        Ok(merged)
    }

    fn day_events(&self, resource_ids: &[Ulid], window: &Span) -> Result<(Vec<ResourceRules>, Vec<ScheduleEvent>), EngineError> {
        let mut rules = Vec::with_capacity(resource_ids.len());
        let mut events = Vec::new();
        for id in resource_ids {
            rules.push(self.rules(*id)?);
            events.extend(self.store.get_events_for(*id, window));
        }
        Ok((rules, events))
    }

    /// One resource's day as a single column of stacked slots.
    pub fn single_grid(&self, date: NaiveDate, resource_id: Ulid) -> Result<SingleScheduleGrid, EngineError> {
        let started = Instant::now();
        let rules = self.rules(resource_id)?;
        let window = day_window(date, 1);
        let events = self.store.get_events_for(resource_id, &window);
        let grid = SingleScheduleGrid::new(date, rules, events)?;
        metrics::histogram!(crate::observability::GRID_BUILD_DURATION_SECONDS, "grid" => "single")
            .record(started.elapsed().as_secs_f64());
        Ok(grid)
    }

    /// Several resources side by side for one day.
    pub fn day_grid(&self, date: NaiveDate, resource_ids: &[Ulid]) -> Result<MultiScheduleGrid, EngineError> {
        let started = Instant::now();
        let (rules, events) = self.day_events(resource_ids, &day_window(date, 1))?;
        let grid = MultiScheduleGrid::build(date, &rules, events);
        metrics::histogram!(crate::observability::GRID_BUILD_DURATION_SECONDS, "grid" => "multi")
            .record(started.elapsed().as_secs_f64());
        Ok(grid)
    }

    /// Several resources over a run of whole days.
    pub fn days_grid(
        &self,
        start: NaiveDate,
        days: u32,
        resource_ids: &[Ulid],
    ) -> Result<MultiDayGrid, EngineError> {
        if days == 0 || days > MAX_GRID_DAYS {
            return Err(EngineError::LimitExceeded("day range out of bounds"));
        }
        let started = Instant::now();
        let (rules, events) = self.day_events(resource_ids, &day_window(start, days))?;
        let grid = MultiDayGrid::build(start, days, &rules, events);
        metrics::histogram!(crate::observability::GRID_BUILD_DURATION_SECONDS, "grid" => "multi_day")
            .record(started.elapsed().as_secs_f64());
        Ok(grid)
    }
}

fn day_window(start: NaiveDate, days: u32) -> Span {
    let end = start
        .checked_add_days(Days::new(days as u64))
        .map_or(day_start(start) + days as Ms * DAY_MS, day_start);
    Span::new(day_start(start), end)
}
