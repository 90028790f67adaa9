//! Pure pieces of series reconciliation: expanding a rule into instance
//! times and diffing those times against already-allocated instances.

use std::cmp::Ordering;

use ulid::Ulid;

use crate::model::{Ms, Mutation, ScheduleEvent};
use crate::recurrence::CronEvaluator;

/// Why an expansion stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expansion {
    /// The instance cap was reached.
    Capped,
    /// The evaluator found no further valid time.
    Exhausted,
    /// The next valid time fell after the repeat-until bound.
    Until,
}

/// Up to `remaining` valid times strictly after `from`, none after `until`.
pub fn expand(
    evaluator: &dyn CronEvaluator,
    cron_text: &str,
    from: Ms,
    remaining: usize,
    until: Option<Ms>,
) -> (Vec<Ms>, Expansion) {
    let mut times = Vec::new();
    let mut after = from;
    loop {
        if times.len() >= remaining {
            return (times, Expansion::Capped);
        }
        let Some(next) = evaluator.next_valid_time(cron_text, after) else {
            return (times, Expansion::Exhausted);
        };
        if until.is_some_and(|u| next > u) {
            return (times, Expansion::Until);
        }
        // An evaluator that does not move forward would loop forever.
        if next <= after {
            return (times, Expansion::Exhausted);
        }
        times.push(next);
        after = next;
    }
}

/// A copy of `template` for one instance of the series.
pub fn instance_at(template: &ScheduleEvent, id: Ulid, series_id: Ulid, start: Ms) -> ScheduleEvent {
    ScheduleEvent {
        id,
        span: template.span.moved_to(start),
        series_id: Some(series_id),
        ..template.clone()
    }
}

/// Mutations turning the `future` instances into one instance per `times`.
///
/// Two-pointer merge over both start-ordered lists: an instance already at
/// one of the new times stays (rewritten only if the template changed),
/// remaining instances are moved onto remaining times in order, leftover
/// times become new instances and leftover instances are deleted.
pub fn merge_instances(
    future: &[ScheduleEvent],
    times: &[Ms],
    template: &ScheduleEvent,
    series_id: Ulid,
) -> Vec<Mutation> {
    let mut kept = vec![false; future.len()];
    let mut taken = vec![false; times.len()];
    let (mut i, mut j) = (0, 0);
    while i < future.len() && j < times.len() {
        match future[i].span.start.cmp(&times[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                kept[i] = true;
                taken[j] = true;
                i += 1;
                j += 1;
            }
        }
    }

    let mut mutations = Vec::new();
    for (instance, _) in future.iter().zip(&kept).filter(|(_, k)| **k) {
        let wanted = instance_at(template, instance.id, series_id, instance.span.start);
        if wanted != *instance {
            mutations.push(Mutation::EventUpdated(wanted));
        }
    }

    let mut spare = future
        .iter()
        .zip(&kept)
        .filter(|(_, k)| !**k)
        .map(|(instance, _)| instance);
    let free_times = times.iter().zip(&taken).filter(|(_, t)| !**t).map(|(t, _)| *t);
    for time in free_times {
        match spare.next() {
            Some(instance) => mutations.push(Mutation::EventUpdated(instance_at(
                template,
                instance.id,
                series_id,
                time,
            ))),
            None => mutations.push(Mutation::EventCreated(instance_at(
                template,
                Ulid::new(),
                series_id,
                time,
            ))),
        }
    }
    for instance in spare {
        mutations.push(Mutation::EventDeleted {
            id: instance.id,
            resource_id: instance.resource_id,
        });
    }
    mutations
}
