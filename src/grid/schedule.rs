use std::sync::Arc;

use ulid::Ulid;

use super::{align_down, align_up};
use crate::model::{ResourceRules, ScheduleEvent, Span};

/// One grid column: a resource's rules and the events laid into it.
///
/// Non-blocking events never intersect within a column, measured on
/// cell-aligned spans. Blocks may overlap anything.
#[derive(Debug, Clone)]
pub struct Schedule {
    rules: ResourceRules,
    group: usize,
    is_virtual: bool,
    cell_mins: u32,
    non_blocking: Vec<Arc<ScheduleEvent>>,
    blocking: Vec<Arc<ScheduleEvent>>,
}

impl Schedule {
    pub(crate) fn new(rules: ResourceRules, group: usize, cell_mins: u32) -> Self {
        Self {
            rules,
            group,
            is_virtual: false,
            cell_mins,
            non_blocking: Vec::new(),
            blocking: Vec::new(),
        }
    }

    /// An empty column with the same rules and the same blocks.
    pub(crate) fn clone_virtual(&self) -> Self {
        Self {
            rules: self.rules.clone(),
            group: self.group,
            is_virtual: true,
            cell_mins: self.cell_mins,
            non_blocking: Vec::new(),
            blocking: self.blocking.clone(),
        }
    }

    pub fn rules(&self) -> &ResourceRules {
        &self.rules
    }

    pub fn resource_id(&self) -> Ulid {
        self.rules.id
    }

    /// Position of the originating resource in the grid's resource list,
    /// set only on virtual columns.
    pub fn origin(&self) -> Option<usize> {
        self.is_virtual.then_some(self.group)
    }

    pub(crate) fn group(&self) -> usize {
        self.group
    }

    pub fn non_blocking(&self) -> &[Arc<ScheduleEvent>] {
        &self.non_blocking
    }

    pub fn blocking(&self) -> &[Arc<ScheduleEvent>] {
        &self.blocking
    }

    fn aligned(&self, span: &Span) -> Span {
        Span {
            start: align_down(span.start, self.cell_mins),
            end: align_up(span.end, self.cell_mins),
        }
    }

    /// True if `event` would share a cell with a non-blocking event here.
    pub fn intersects(&self, event: &ScheduleEvent) -> bool {
        let window = self.aligned(&event.span);
        self.non_blocking_in(window).next().is_some()
    }

    /// Add the event; fails only for a non-blocking event that intersects.
    pub(crate) fn add_event(&mut self, event: &Arc<ScheduleEvent>) -> bool {
        let list = if event.is_blocking() {
            &mut self.blocking
        } else {
            if self.intersects(event) {
                return false;
            }
            &mut self.non_blocking
        };
        let pos = list.partition_point(|e| e.span.start <= event.span.start);
        list.insert(pos, Arc::clone(event));
        true
    }

    fn non_blocking_in(&self, window: Span) -> impl Iterator<Item = &Arc<ScheduleEvent>> {
        let right = self
            .non_blocking
            .partition_point(|e| align_down(e.span.start, self.cell_mins) < window.end);
        self.non_blocking[..right]
            .iter()
            .filter(move |e| align_up(e.span.end, self.cell_mins) > window.start)
    }

    /// The event shown in `window`: a non-blocking event first, else a block.
    pub fn event_in(&self, window: &Span) -> Option<&Arc<ScheduleEvent>> {
        self.non_blocking_in(*window).next().or_else(|| {
            self.blocking
                .iter()
                .find(|e| self.aligned(&e.span).overlaps(window))
        })
    }

    /// True if `minute` (from midnight) is inside the operating window.
    pub fn is_open_at(&self, minute: u32) -> bool {
        self.rules.start_mins <= minute && minute < self.rules.end_mins
    }
}
