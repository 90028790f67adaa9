//! Recurring series of events.
//!
//! A series is an anchor event plus a recurrence rule. Saving compares the
//! rule the series was loaded with against the one now set and writes the
//! difference as one atomic batch:
//!
//! - no rule before, rule now: create the series and expand it from the anchor
//! - rule changed: keep elapsed instances, re-expand after the last of them
//!   and reuse future instance records in start order
//! - rule cleared: drop future instances; delete the series unless elapsed
//!   history still refers to it
//!
//! Members can also be deleted directly, see [`DeleteScope`]. A series never
//! outlives its last member.

mod reconcile;

pub use reconcile::{Expansion, expand, instance_at, merge_instances};

use std::collections::HashSet;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{EngineError, EventStore};
use crate::limits::{DEFAULT_MAX_INSTANCES, MAX_SAVE_ATTEMPTS, MAX_SERIES_INSTANCES};
use crate::model::{Batch, Ms, Mutation, ScheduleEvent, SeriesRecord};
use crate::recurrence::{CronEvaluator, RecurrenceExpression};

/// What a save will write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesPlan {
    pub series_id: Ulid,
    pub batch: Batch,
    /// Events created or moved, for overlap checking.
    pub candidates: Vec<ScheduleEvent>,
    /// The anchor and every future instance as they stand after the batch,
    /// in start order.
    pub members: Vec<ScheduleEvent>,
    /// `None` when the rule was cleared.
    pub expansion: Option<Expansion>,
}

/// How much of a series a delete takes, counted from the chosen member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteScope {
    /// That member alone.
    One,
    /// That member and every later one. What is left stops recurring.
    Following,
    /// Every member, and the series with them.
    All,
}

#[derive(Debug, Clone)]
pub struct Series {
    anchor: ScheduleEvent,
    loaded_anchor: ScheduleEvent,
    record: Option<SeriesRecord>,
    previous: Option<RecurrenceExpression>,
    expression: Option<RecurrenceExpression>,
    max_instances: u32,
    until: Option<Ms>,
    /// Persisted instances other than the anchor, in start order.
    instances: Vec<ScheduleEvent>,
}

impl Series {
    /// A series for an anchor that is not part of one yet.
    pub fn new(anchor: ScheduleEvent) -> Self {
        Self {
            loaded_anchor: anchor.clone(),
            anchor,
            record: None,
            previous: None,
            expression: None,
            max_instances: DEFAULT_MAX_INSTANCES,
            until: None,
            instances: Vec::new(),
        }
    }

    /// Load the series `event_id` belongs to, or a fresh one when it is
    /// not linked to any.
    pub fn load<S: EventStore + ?Sized>(store: &S, event_id: Ulid) -> Result<Self, EngineError> {
        let event = store.event(event_id).ok_or(EngineError::NotFound(event_id))?;
        let Some(series_id) = event.series_id else {
            return Ok(Self::new(event));
        };
        let record = store
            .series(series_id)
            .ok_or(EngineError::NotFound(series_id))?;
        let anchor = if record.anchor_id == event.id {
            event
        } else {
            store
                .event(record.anchor_id)
                .ok_or(EngineError::NotFound(record.anchor_id))?
        };
        let mut series = Self::new(anchor);
        series.max_instances = record.max_instances;
        series.until = record.until;
        series.adopt(store, Some(record))?;
        series.expression = series.previous;
        Ok(series)
    }

    /// Take the persisted record and instances as the new baseline. The
    /// desired rule and settings are left alone.
    fn adopt<S: EventStore + ?Sized>(
        &mut self,
        store: &S,
        record: Option<SeriesRecord>,
    ) -> Result<(), EngineError> {
        self.previous = match record.as_ref().and_then(|r| r.expression.as_deref()) {
            Some(text) => Some(RecurrenceExpression::parse(text)?),
            None => None,
        };
        self.instances = match &record {
            Some(r) => store
                .series_instances(r.id)
                .into_iter()
                .filter(|e| e.id != self.anchor.id)
                .collect(),
            None => Vec::new(),
        };
        self.record = record;
        Ok(())
    }

    /// Re-read the anchor, record and instances from the store.
    fn reload<S: EventStore + ?Sized>(&mut self, store: &S) -> Result<(), EngineError> {
        let stored = store
            .event(self.anchor.id)
            .ok_or(EngineError::NotFound(self.anchor.id))?;
        self.anchor.series_id = stored.series_id;
        self.loaded_anchor = stored;
        let record = self.anchor.series_id.and_then(|id| store.series(id));
        self.adopt(store, record)
    }

    pub fn anchor(&self) -> &ScheduleEvent {
        &self.anchor
    }

    /// Edits to the anchor carry over to every future instance on save.
    pub fn anchor_mut(&mut self) -> &mut ScheduleEvent {
        &mut self.anchor
    }

    pub fn id(&self) -> Option<Ulid> {
        self.record.as_ref().map(|r| r.id)
    }

    pub fn record(&self) -> Option<&SeriesRecord> {
        self.record.as_ref()
    }

    pub fn expression(&self) -> Option<&RecurrenceExpression> {
        self.expression.as_ref()
    }

    pub fn previous(&self) -> Option<&RecurrenceExpression> {
        self.previous.as_ref()
    }

    pub fn instances(&self) -> &[ScheduleEvent] {
        &self.instances
    }

    /// The stored anchor followed by the other instances, in start order.
    pub fn members(&self) -> impl Iterator<Item = &ScheduleEvent> {
        std::iter::once(&self.loaded_anchor).chain(&self.instances)
    }

    pub fn index_of(&self, event_id: Ulid) -> Option<usize> {
        self.members().position(|e| e.id == event_id)
    }

    /// Whether the members from `index` on may still be changed at `now`:
    /// none after it has started. The member at `index` itself always may.
    pub fn can_edit_from(&self, index: usize, now: Ms) -> bool {
        self.members().skip(index + 1).all(|e| e.span.start > now)
    }

    pub fn max_instances(&self) -> u32 {
        self.max_instances
    }

    pub fn until(&self) -> Option<Ms> {
        self.until
    }

    pub fn set_expression(&mut self, expression: Option<RecurrenceExpression>) {
        self.expression = expression;
    }

    /// Instances the series expands to, the anchor included.
    pub fn set_max_instances(&mut self, max: u32) -> Result<(), EngineError> {
        if max == 0 || max > MAX_SERIES_INSTANCES {
            return Err(EngineError::LimitExceeded("series size out of range"));
        }
        self.max_instances = max;
        Ok(())
    }

    /// Stop expanding after this instant.
    pub fn set_until(&mut self, until: Option<Ms>) {
        self.until = until;
    }

    pub fn is_modified(&self) -> bool {
        if self.expression != self.previous || self.anchor != self.loaded_anchor {
            return true;
        }
        match (&self.record, &self.expression) {
            (Some(record), Some(_)) => {
                record.max_instances != self.max_instances || record.until != self.until
            }
            _ => false,
        }
    }

    /// The batch a save would write, `None` when there is nothing to do.
    pub fn plan(&self, evaluator: &dyn CronEvaluator, now: Ms) -> Option<SeriesPlan> {
        if !self.is_modified() {
            return None;
        }
        match (&self.record, &self.expression) {
            (None, None) => None,
            (None, Some(expr)) => Some(self.plan_create(expr, evaluator)),
            (Some(record), Some(expr)) => Some(self.plan_update(record, expr, evaluator, now)),
            (Some(record), None) => Some(self.plan_clear(record, now)),
        }
    }

    fn linked_anchor(&self, series_id: Option<Ulid>) -> ScheduleEvent {
        ScheduleEvent {
            series_id,
            ..self.anchor.clone()
        }
    }

    /// The anchor was edited in a way that needs an overlap check.
    fn anchor_moved(&self) -> bool {
        self.anchor.span != self.loaded_anchor.span
            || self.anchor.resource_id != self.loaded_anchor.resource_id
            || self.anchor.kind != self.loaded_anchor.kind
    }

    fn plan_create(&self, expr: &RecurrenceExpression, evaluator: &dyn CronEvaluator) -> SeriesPlan {
        // One series per anchor: a concurrent creator collides on the id.
        let id = self.anchor.id;
        let text = expr.to_cron_text();
        let anchor = self.linked_anchor(Some(id));
        let (times, expansion) = expand(
            evaluator,
            &text,
            anchor.span.start,
            self.max_instances.saturating_sub(1) as usize,
            self.until,
        );
        let created: Vec<ScheduleEvent> = times
            .iter()
            .map(|t| instance_at(&anchor, Ulid::new(), id, *t))
            .collect();
        let mut candidates = created.clone();
        if self.anchor_moved() {
            candidates.insert(0, anchor.clone());
        }
        let mut members = vec![anchor.clone()];
        members.extend(created.iter().cloned());

        let record = SeriesRecord {
            id,
            anchor_id: anchor.id,
            resource_id: anchor.resource_id,
            expression: Some(text),
            start_time: anchor.span.start,
            max_instances: self.max_instances,
            until: self.until,
            version: 1,
        };
        let mut mutations = vec![Mutation::SeriesCreated(record), Mutation::EventUpdated(anchor)];
        mutations.extend(created.into_iter().map(Mutation::EventCreated));
        debug!(series_id = %id, instances = members.len(), ?expansion, "planned new series");
        SeriesPlan {
            series_id: id,
            batch: Batch {
                mutations,
                expect: Some((id, 0)),
            },
            candidates,
            members,
            expansion: Some(expansion),
        }
    }

    fn plan_update(
        &self,
        record: &SeriesRecord,
        expr: &RecurrenceExpression,
        evaluator: &dyn CronEvaluator,
        now: Ms,
    ) -> SeriesPlan {
        let (expired, future): (Vec<&ScheduleEvent>, Vec<&ScheduleEvent>) =
            self.instances.iter().partition(|e| e.span.start <= now);
        let future: Vec<ScheduleEvent> = future.into_iter().cloned().collect();
        let anchor = self.linked_anchor(Some(record.id));
        let text = expr.to_cron_text();

        let counted = 1 + expired.len();
        let from = expired
            .last()
            .map_or(anchor.span.start, |e| e.span.start)
            .max(anchor.span.start);
        let (times, expansion) = expand(
            evaluator,
            &text,
            from,
            (self.max_instances as usize).saturating_sub(counted),
            self.until,
        );
        let changes = merge_instances(&future, &times, &anchor, record.id);
        let mut candidates: Vec<ScheduleEvent> = changes
            .iter()
            .filter_map(|m| match m {
                Mutation::EventCreated(e) | Mutation::EventUpdated(e) => Some(e.clone()),
                _ => None,
            })
            .collect();
        let touched: HashSet<Ulid> = changes
            .iter()
            .filter_map(|m| match m {
                Mutation::EventUpdated(e) => Some(e.id),
                Mutation::EventDeleted { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        let mut members = vec![anchor.clone()];
        members.extend(future.iter().filter(|e| !touched.contains(&e.id)).cloned());
        members.extend(candidates.iter().cloned());
        members.sort_by_key(|e| (e.span.start, e.id));
        if self.anchor_moved() {
            candidates.insert(0, anchor.clone());
        }

        let updated = SeriesRecord {
            expression: Some(text),
            max_instances: self.max_instances,
            until: self.until,
            version: record.version + 1,
            ..record.clone()
        };
        let mut mutations = vec![Mutation::SeriesUpdated(updated)];
        if anchor != self.loaded_anchor {
            mutations.push(Mutation::EventUpdated(anchor));
        }
        mutations.extend(changes);
        debug!(
            series_id = %record.id,
            expired = expired.len(),
            future = future.len(),
            times = times.len(),
            ?expansion,
            "planned series update"
        );
        SeriesPlan {
            series_id: record.id,
            batch: Batch {
                mutations,
                expect: Some((record.id, record.version)),
            },
            candidates,
            members,
            expansion: Some(expansion),
        }
    }

    fn plan_clear(&self, record: &SeriesRecord, now: Ms) -> SeriesPlan {
        let (expired, future): (Vec<&ScheduleEvent>, Vec<&ScheduleEvent>) =
            self.instances.iter().partition(|e| e.span.start <= now);
        let history = !expired.is_empty() || self.anchor.span.start <= now;

        let mut mutations = Vec::new();
        let anchor = self.linked_anchor(history.then_some(record.id));
        if history {
            mutations.push(Mutation::SeriesUpdated(SeriesRecord {
                expression: None,
                version: record.version + 1,
                ..record.clone()
            }));
            if anchor != self.loaded_anchor {
                mutations.push(Mutation::EventUpdated(anchor.clone()));
            }
        } else {
            mutations.push(Mutation::SeriesDeleted { id: record.id });
            mutations.push(Mutation::EventUpdated(anchor.clone()));
        }
        mutations.extend(future.iter().map(|e| Mutation::EventDeleted {
            id: e.id,
            resource_id: e.resource_id,
        }));
        debug!(series_id = %record.id, history, removed = future.len(), "planned series clear");
        SeriesPlan {
            series_id: record.id,
            batch: Batch {
                mutations,
                expect: Some((record.id, record.version)),
            },
            candidates: if self.anchor_moved() {
                vec![anchor.clone()]
            } else {
                Vec::new()
            },
            members: vec![anchor],
            expansion: None,
        }
    }

    /// The batch deleting `event_id` and whatever else `scope` takes with it.
    /// When members remain, the earliest becomes the anchor; when none do, the
    /// series is deleted too.
    pub fn plan_delete(&self, event_id: Ulid, scope: DeleteScope) -> Result<SeriesPlan, EngineError> {
        let record = self
            .record
            .as_ref()
            .ok_or(EngineError::NotInSeries(event_id))?;
        let index = self.index_of(event_id).ok_or(EngineError::NotFound(event_id))?;

        let mut kept = Vec::new();
        let mut removed = Vec::new();
        for (i, member) in self.members().enumerate() {
            let keep = match scope {
                DeleteScope::One => i != index,
                DeleteScope::Following => i < index,
                DeleteScope::All => false,
            };
            if keep {
                kept.push(member.clone());
            } else {
                removed.push(member);
            }
        }

        let mut mutations = Vec::with_capacity(removed.len() + 1);
        match kept.first() {
            None => mutations.push(Mutation::SeriesDeleted { id: record.id }),
            Some(first) => mutations.push(Mutation::SeriesUpdated(SeriesRecord {
                anchor_id: first.id,
                start_time: first.span.start,
                expression: match scope {
                    DeleteScope::Following => None,
                    _ => record.expression.clone(),
                },
                version: record.version + 1,
                ..record.clone()
            })),
        }
        mutations.extend(removed.iter().map(|e| Mutation::EventDeleted {
            id: e.id,
            resource_id: e.resource_id,
        }));
        debug!(
            series_id = %record.id,
            index,
            ?scope,
            removed = removed.len(),
            kept = kept.len(),
            "planned series delete"
        );
        Ok(SeriesPlan {
            series_id: record.id,
            batch: Batch {
                mutations,
                expect: Some((record.id, record.version)),
            },
            candidates: Vec::new(),
            members: kept,
            expansion: None,
        })
    }

    /// Delete members of the series `event_id` belongs to. A stale write is
    /// replanned from a fresh load, up to `attempts` times.
    pub fn delete<S: EventStore + ?Sized>(
        store: &S,
        event_id: Ulid,
        scope: DeleteScope,
        attempts: u32,
    ) -> Result<SeriesPlan, EngineError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            let plan = Self::load(store, event_id)?.plan_delete(event_id, scope)?;
            match store.apply(&plan.batch) {
                Ok(()) => {
                    info!(
                        series_id = %plan.series_id,
                        %event_id,
                        ?scope,
                        remaining = plan.members.len(),
                        attempt,
                        "series members deleted"
                    );
                    return Ok(plan);
                }
                Err(e) if e.is_retriable() && attempt < attempts => {
                    metrics::counter!(crate::observability::SERIES_SAVE_RETRIES_TOTAL).increment(1);
                    warn!(series_id = %plan.series_id, attempt, error = %e, "series changed underneath, replanning delete");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Plan and apply atomically, recomputing from fresh state when the
    /// store reports the series changed underneath.
    pub fn save<S: EventStore + ?Sized>(
        &mut self,
        store: &S,
        evaluator: &dyn CronEvaluator,
        now: Ms,
    ) -> Result<Option<SeriesPlan>, EngineError> {
        self.save_checked(store, evaluator, now, MAX_SAVE_ATTEMPTS, |_| Ok(()))
    }

    /// [`Series::save`] with a hook that can veto each plan, and an explicit
    /// attempt budget. The hook runs through [`EventStore::apply_checked`],
    /// inside the store's write section, so it must only read the store.
    pub fn save_checked<S, F>(
        &mut self,
        store: &S,
        evaluator: &dyn CronEvaluator,
        now: Ms,
        attempts: u32,
        mut check: F,
    ) -> Result<Option<SeriesPlan>, EngineError>
    where
        S: EventStore + ?Sized,
        F: FnMut(&SeriesPlan) -> Result<(), EngineError>,
    {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            let Some(plan) = self.plan(evaluator, now) else {
                return Ok(None);
            };
            match store.apply_checked(&plan.batch, &mut || check(&plan)) {
                Ok(()) => {
                    metrics::counter!(crate::observability::SERIES_SAVES_TOTAL).increment(1);
                    info!(
                        series_id = %plan.series_id,
                        mutations = plan.batch.len(),
                        attempt,
                        "series saved"
                    );
                    self.reload(store)?;
                    return Ok(Some(plan));
                }
                Err(e) if e.is_retriable() && attempt < attempts => {
                    metrics::counter!(crate::observability::SERIES_SAVE_RETRIES_TOTAL).increment(1);
                    warn!(series_id = %plan.series_id, attempt, error = %e, "series changed underneath, recomputing");
                    self.reload(store)?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
