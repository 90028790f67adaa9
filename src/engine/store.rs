use std::collections::{BTreeSet, HashMap, HashSet};

use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, StoreError};

/// The event store the series reconciler and the grid queries work against.
pub trait EventStore {
    /// Apply every mutation of the batch or none of them.
    fn apply(&self, batch: &Batch) -> Result<(), StoreError>;

    /// Apply the batch only if `check` passes. Stores with concurrent
    /// writers run `check` with those writers shut out until the batch is
    /// in, so what it saw is still true when the batch lands.
    fn apply_checked(
        &self,
        batch: &Batch,
        check: &mut dyn FnMut() -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        check()?;
        Ok(self.apply(batch)?)
    }

    fn event(&self, id: Ulid) -> Option<ScheduleEvent>;

    fn series(&self, id: Ulid) -> Option<SeriesRecord>;

    /// Events linked to the series, anchor included, in start order.
    fn series_instances(&self, id: Ulid) -> Vec<ScheduleEvent>;

    /// Events of the resource overlapping `span`, in start order.
    fn events_for(&self, resource_id: Ulid, span: &Span) -> Vec<ScheduleEvent>;

    fn resource(&self, id: Ulid) -> Option<ResourceRules>;
}

/// DashMap-indexed state. Writes come through [`InMemoryStore::apply_batch`]
/// only, after [`InMemoryStore::validate`] has accepted the batch.
pub struct InMemoryStore {
    resources: DashMap<Ulid, ResourceState>,
    entity_to_resource: DashMap<Ulid, Ulid>,
    series: DashMap<Ulid, SeriesRecord>,
    series_members: DashMap<Ulid, BTreeSet<Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Existence of ids as seen part-way through a batch.
#[derive(Default)]
struct Overlay {
    resources: HashSet<Ulid>,
    events: HashMap<Ulid, Option<Ulid>>,
    series: HashMap<Ulid, bool>,
    added_per_resource: HashMap<Ulid, usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            entity_to_resource: DashMap::new(),
            series: DashMap::new(),
            series_members: DashMap::new(),
        }
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn resource_ids(&self) -> Vec<Ulid> {
        self.resources.iter().map(|e| *e.key()).collect()
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    fn resource_exists(&self, id: Ulid, overlay: &Overlay) -> bool {
        overlay.resources.contains(&id) || self.resources.contains_key(&id)
    }

    /// Resource the event lives on, `None` if it does not exist.
    fn event_location(&self, id: Ulid, overlay: &Overlay) -> Option<Ulid> {
        match overlay.events.get(&id) {
            Some(location) => *location,
            None => self.get_resource_for_entity(&id),
        }
    }

    fn series_exists(&self, id: Ulid, overlay: &Overlay) -> bool {
        match overlay.series.get(&id) {
            Some(exists) => *exists,
            None => self.series.contains_key(&id),
        }
    }

    /// Check the batch against current state without changing anything.
    pub fn validate(&self, batch: &Batch) -> Result<(), StoreError> {
        if batch.len() > MAX_BATCH_MUTATIONS {
            return Err(StoreError::LimitExceeded("too many mutations in batch"));
        }
        if let Some((id, expected)) = batch.expect {
            let found = self.series.get(&id).map_or(0, |s| s.version);
            if found != expected {
                return Err(StoreError::StaleSeries { id, expected, found });
            }
        }

        let mut overlay = Overlay::default();
        for mutation in &batch.mutations {
            match mutation {
                Mutation::ResourceCreated(rules) => {
                    if self.resource_exists(rules.id, &overlay) {
                        return Err(StoreError::AlreadyExists(rules.id));
                    }
                    check_name(rules)?;
                    overlay.resources.insert(rules.id);
                }
                Mutation::ResourceUpdated(rules) => {
                    if !self.resource_exists(rules.id, &overlay) {
                        return Err(StoreError::NotFound(rules.id));
                    }
                    check_name(rules)?;
                }
                Mutation::EventCreated(event) => {
                    if self.event_location(event.id, &overlay).is_some() {
                        return Err(StoreError::AlreadyExists(event.id));
                    }
                    self.check_event(event, &mut overlay)?;
                }
                Mutation::EventUpdated(event) => {
                    if self.event_location(event.id, &overlay).is_none() {
                        return Err(StoreError::NotFound(event.id));
                    }
                    self.check_event(event, &mut overlay)?;
                }
                Mutation::EventDeleted { id, .. } => {
                    if self.event_location(*id, &overlay).is_none() {
                        return Err(StoreError::NotFound(*id));
                    }
                    overlay.events.insert(*id, None);
                }
                Mutation::SeriesCreated(record) => {
                    if self.series_exists(record.id, &overlay) {
                        return Err(StoreError::AlreadyExists(record.id));
                    }
                    overlay.series.insert(record.id, true);
                }
                Mutation::SeriesUpdated(record) => {
                    if !self.series_exists(record.id, &overlay) {
                        return Err(StoreError::NotFound(record.id));
                    }
                }
                Mutation::SeriesDeleted { id } => {
                    if !self.series_exists(*id, &overlay) {
                        return Err(StoreError::NotFound(*id));
                    }
                    overlay.series.insert(*id, false);
                }
            }
        }
        Ok(())
    }

    fn check_event(&self, event: &ScheduleEvent, overlay: &mut Overlay) -> Result<(), StoreError> {
        if !self.resource_exists(event.resource_id, overlay) {
            return Err(StoreError::NotFound(event.resource_id));
        }
        if event.span.start >= event.span.end
            || event.span.start < MIN_VALID_TIMESTAMP_MS
            || event.span.end > MAX_VALID_TIMESTAMP_MS
        {
            return Err(StoreError::LimitExceeded("event span out of range"));
        }
        if event.span.duration_ms() > MAX_SPAN_DURATION_MS {
            return Err(StoreError::LimitExceeded("event span too wide"));
        }
        if let Some(series_id) = event.series_id
            && !self.series_exists(series_id, overlay)
        {
            return Err(StoreError::NotFound(series_id));
        }
        let existing = self
            .resources
            .get(&event.resource_id)
            .map_or(0, |rs| rs.events().len());
        let added = overlay.added_per_resource.entry(event.resource_id).or_default();
        *added += 1;
        if existing + *added > MAX_EVENTS_PER_RESOURCE {
            return Err(StoreError::LimitExceeded("too many events on resource"));
        }
        overlay.events.insert(event.id, Some(event.resource_id));
        Ok(())
    }

    /// Apply a validated batch.
    pub fn apply_batch(&self, batch: &Batch) {
        for mutation in &batch.mutations {
            self.apply_mutation(mutation);
        }
    }

    fn apply_mutation(&self, mutation: &Mutation) {
        match mutation {
            Mutation::ResourceCreated(rules) => {
                self.resources
                    .insert(rules.id, ResourceState::new(rules.clone()));
            }
            Mutation::ResourceUpdated(rules) => {
                if let Some(mut rs) = self.resources.get_mut(&rules.id) {
                    rs.rules = rules.clone();
                }
            }
            Mutation::EventCreated(event) | Mutation::EventUpdated(event) => {
                self.remove_event(event.id);
                if let Some(mut rs) = self.resources.get_mut(&event.resource_id) {
                    rs.insert_event(event.clone());
                }
                self.entity_to_resource.insert(event.id, event.resource_id);
                if let Some(series_id) = event.series_id {
                    self.series_members
                        .entry(series_id)
                        .or_default()
                        .insert(event.id);
                }
            }
            Mutation::EventDeleted { id, .. } => {
                self.remove_event(*id);
            }
            Mutation::SeriesCreated(record) | Mutation::SeriesUpdated(record) => {
                self.series.insert(record.id, record.clone());
            }
            Mutation::SeriesDeleted { id } => {
                self.series.remove(id);
                self.series_members.remove(id);
            }
        }
    }

    fn remove_event(&self, id: Ulid) -> Option<ScheduleEvent> {
        let (_, resource_id) = self.entity_to_resource.remove(&id)?;
        let removed = self
            .resources
            .get_mut(&resource_id)
            .and_then(|mut rs| rs.remove_event(id))?;
        if let Some(series_id) = removed.series_id
            && let Some(mut members) = self.series_members.get_mut(&series_id)
        {
            members.remove(&id);
        }
        Some(removed)
    }

    /// The smallest set of batches that recreates the current state.
    pub fn snapshot(&self) -> Vec<Batch> {
        let mut batches: Vec<Batch> = self
            .resources
            .iter()
            .map(|rs| Batch::single(Mutation::ResourceCreated(rs.rules.clone())))
            .collect();
        batches.extend(
            self.series
                .iter()
                .map(|s| Batch::single(Mutation::SeriesCreated(s.value().clone()))),
        );
        for rs in self.resources.iter() {
            for chunk in rs.events().chunks(MAX_BATCH_MUTATIONS) {
                batches.push(Batch {
                    mutations: chunk.iter().cloned().map(Mutation::EventCreated).collect(),
                    expect: None,
                });
            }
        }
        batches
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn get_event(&self, id: Ulid) -> Option<ScheduleEvent> {
        let resource_id = self.get_resource_for_entity(&id)?;
        let rs = self.resources.get(&resource_id)?;
        rs.get_event(id).cloned()
    }

    pub fn get_series(&self, id: Ulid) -> Option<SeriesRecord> {
        self.series.get(&id).map(|s| s.value().clone())
    }

    pub fn get_series_instances(&self, id: Ulid) -> Vec<ScheduleEvent> {
        let ids: Vec<Ulid> = self
            .series_members
            .get(&id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        let mut events: Vec<ScheduleEvent> =
            ids.into_iter().filter_map(|id| self.get_event(id)).collect();
        events.sort_by_key(|e| (e.span.start, e.id));
        events
    }

    pub fn get_events_for(&self, resource_id: Ulid, span: &Span) -> Vec<ScheduleEvent> {
        self.resources
            .get(&resource_id)
            .map(|rs| rs.overlapping(span).cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_rules(&self, id: Ulid) -> Option<ResourceRules> {
        self.resources.get(&id).map(|rs| rs.rules.clone())
    }

    /// Run `f` against the resource's state without cloning its events.
    pub fn with_resource<T>(&self, id: Ulid, f: impl FnOnce(&ResourceState) -> T) -> Option<T> {
        self.resources.get(&id).map(|rs| f(&rs))
    }
}

fn check_name(rules: &ResourceRules) -> Result<(), StoreError> {
    if rules.name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(StoreError::LimitExceeded("resource name too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ResourceRules {
        ResourceRules::new(Ulid::new(), Some("Surgery".into()), 480, 1080, 15, false).unwrap()
    }

    fn appt(resource_id: Ulid, start: Ms) -> ScheduleEvent {
        ScheduleEvent::appointment(Ulid::new(), resource_id, Span::new(start, start + 30 * MINUTE_MS))
    }

    fn store_with(rules: &ResourceRules) -> InMemoryStore {
        let store = InMemoryStore::new();
        let batch = Batch::single(Mutation::ResourceCreated(rules.clone()));
        store.validate(&batch).unwrap();
        store.apply_batch(&batch);
        store
    }

    #[test]
    fn events_created_in_the_same_batch_can_be_updated_and_deleted() {
        let r = rules();
        let store = store_with(&r);
        let e = appt(r.id, 0);
        let mut moved = e.clone();
        moved.span = e.span.moved_to(HOUR_MS);
        let batch = Batch {
            mutations: vec![
                Mutation::EventCreated(e.clone()),
                Mutation::EventUpdated(moved.clone()),
            ],
            expect: None,
        };
        store.validate(&batch).unwrap();
        store.apply_batch(&batch);
        assert_eq!(store.get_event(e.id), Some(moved));

        let delete_twice = Batch {
            mutations: vec![
                Mutation::EventDeleted { id: e.id, resource_id: r.id },
                Mutation::EventDeleted { id: e.id, resource_id: r.id },
            ],
            expect: None,
        };
        assert!(matches!(store.validate(&delete_twice), Err(StoreError::NotFound(id)) if id == e.id));
    }

    #[test]
    fn unknown_resource_rejects_the_whole_batch() {
        let r = rules();
        let store = store_with(&r);
        let batch = Batch {
            mutations: vec![
                Mutation::EventCreated(appt(r.id, 0)),
                Mutation::EventCreated(appt(Ulid::new(), 0)),
            ],
            expect: None,
        };
        assert!(matches!(store.validate(&batch), Err(StoreError::NotFound(_))));
        assert!(store.get_events_for(r.id, &Span::new(0, DAY_MS)).is_empty());
    }

    #[test]
    fn series_version_guard() {
        let r = rules();
        let store = store_with(&r);
        let record = SeriesRecord {
            id: Ulid::new(),
            anchor_id: Ulid::new(),
            resource_id: r.id,
            expression: Some("0 9 * * *".into()),
            start_time: 0,
            max_instances: 10,
            until: None,
            version: 1,
        };
        let create = Batch {
            mutations: vec![Mutation::SeriesCreated(record.clone())],
            expect: Some((record.id, 0)),
        };
        store.validate(&create).unwrap();
        store.apply_batch(&create);

        // A second creator still expecting version 0 loses.
        let err = store.validate(&create).unwrap_err();
        assert!(err.is_retriable());
        assert!(matches!(err, StoreError::StaleSeries { expected: 0, found: 1, .. }));
    }

    #[test]
    fn series_membership_follows_events() {
        let r = rules();
        let store = store_with(&r);
        let series_id = Ulid::new();
        let mut a = appt(r.id, 2 * HOUR_MS);
        a.series_id = Some(series_id);
        let mut b = appt(r.id, HOUR_MS);
        b.series_id = Some(series_id);
        let record = SeriesRecord {
            id: series_id,
            anchor_id: b.id,
            resource_id: r.id,
            expression: None,
            start_time: HOUR_MS,
            max_instances: 2,
            until: None,
            version: 1,
        };
        let batch = Batch {
            mutations: vec![
                Mutation::SeriesCreated(record),
                Mutation::EventCreated(a.clone()),
                Mutation::EventCreated(b.clone()),
            ],
            expect: None,
        };
        store.validate(&batch).unwrap();
        store.apply_batch(&batch);
        let ids: Vec<_> = store.get_series_instances(series_id).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);

        let mut detached = a.clone();
        detached.series_id = None;
        store.apply_batch(&Batch::single(Mutation::EventUpdated(detached)));
        assert_eq!(store.get_series_instances(series_id).len(), 1);
    }

    #[test]
    fn snapshot_recreates_state() {
        let r = rules();
        let store = store_with(&r);
        let e = appt(r.id, 0);
        store.apply_batch(&Batch::single(Mutation::EventCreated(e.clone())));

        let copy = InMemoryStore::new();
        for batch in store.snapshot() {
            copy.validate(&batch).unwrap();
            copy.apply_batch(&batch);
        }
        assert_eq!(copy.get_event(e.id), Some(e));
        assert_eq!(copy.get_rules(r.id), Some(r));
    }
}
