use std::slice;

use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::series::{DeleteScope, Series, SeriesPlan};

use super::conflict::{ConflictReport, check_overlaps, first_self_overlap, validate_span};
use super::{Engine, EngineError};

impl Engine {
    pub fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        start_mins: u32,
        end_mins: u32,
        slot_size: u32,
        allow_double_booking: bool,
    ) -> Result<ResourceRules, EngineError> {
        let rules = ResourceRules::new(id, name, start_mins, end_mins, slot_size, allow_double_booking)
            .ok_or(EngineError::InvalidRules(id))?;
        let mut wal = self.lock_wal();
        self.commit(&mut wal, &Batch::single(Mutation::ResourceCreated(rules.clone())))?;
        info!(resource_id = %id, start_mins, end_mins, slot_size, "resource created");
        Ok(rules)
    }

    /// Replace a resource's rules. Existing events are left where they are.
    pub fn update_resource(&self, rules: ResourceRules) -> Result<(), EngineError> {
        let checked = ResourceRules::new(
            rules.id,
            rules.name.clone(),
            rules.start_mins,
            rules.end_mins,
            rules.slot_size,
            rules.allow_double_booking,
        )
        .ok_or(EngineError::InvalidRules(rules.id))?;
        let mut wal = self.lock_wal();
        self.commit(&mut wal, &Batch::single(Mutation::ResourceUpdated(checked)))?;
        Ok(())
    }

    /// Create or move one event after checking it against the resource's
    /// other events. Advisory overlaps are returned with the booking.
    pub fn book(&self, event: ScheduleEvent, party: Option<&Party>) -> Result<ConflictReport, EngineError> {
        validate_span(&event.span)?;
        let mut wal = self.lock_wal();
        let report = self
            .store
            .with_resource(event.resource_id, |rs| {
                check_overlaps(slice::from_ref(&event), rs, party, self.config.max_overlaps)
            })
            .ok_or(EngineError::NotFound(event.resource_id))?;
        metrics::counter!(crate::observability::OVERLAP_CHECKS_TOTAL, "verdict" => report.verdict().label())
            .increment(1);
        let report = report.into_result()?;

        let id = event.id;
        let mutation = if self.store.get_resource_for_entity(&id).is_some() {
            Mutation::EventUpdated(event)
        } else {
            Mutation::EventCreated(event)
        };
        self.commit(&mut wal, &Batch::single(mutation))?;
        info!(event_id = %id, overlaps = report.overlaps.len(), "event booked");
        Ok(report)
    }

    /// Remove one event. A series member goes through
    /// [`Engine::cancel_series`] so the series is re-anchored or dropped with it.
    pub fn cancel(&self, id: Ulid) -> Result<ScheduleEvent, EngineError> {
        let mut wal = self.lock_wal();
        let event = self.store.get_event(id).ok_or(EngineError::NotFound(id))?;
        if event
            .series_id
            .is_some_and(|series_id| self.store.get_series(series_id).is_some())
        {
            drop(wal);
            self.cancel_series(id, DeleteScope::One)?;
            return Ok(event);
        }
        self.commit(
            &mut wal,
            &Batch::single(Mutation::EventDeleted {
                id,
                resource_id: event.resource_id,
            }),
        )?;
        info!(event_id = %id, "event cancelled");
        Ok(event)
    }

    /// Delete `event_id` and, per `scope`, later members or the whole series.
    pub fn cancel_series(&self, event_id: Ulid, scope: DeleteScope) -> Result<SeriesPlan, EngineError> {
        Series::delete(self, event_id, scope, self.config.save_attempts)
    }

    /// Save a series, refusing plans whose instances overlap each other or
    /// conflict with the rest of the resource. The checks hold the log lock
    /// through the commit, like [`Engine::book`].
    pub fn save_series(
        &self,
        series: &mut Series,
        party: Option<&Party>,
    ) -> Result<Option<SeriesPlan>, EngineError> {
        self.save_series_at(series, party, now_ms())
    }

    /// [`Engine::save_series`] with an explicit clock.
    pub fn save_series_at(
        &self,
        series: &mut Series,
        party: Option<&Party>,
        now: Ms,
    ) -> Result<Option<SeriesPlan>, EngineError> {
        let attempts = self.config.save_attempts;
        series.save_checked(self, &self.evaluator, now, attempts, |plan| {
            if let Some((a, b)) = first_self_overlap(&plan.members) {
                return Err(EngineError::SeriesOverlap(a, b));
            }
            for candidate in &plan.candidates {
                validate_span(&candidate.span)?;
            }
            self.check_overlaps(&plan.candidates, party)?.into_result()?;
            Ok(())
        })
    }
}
