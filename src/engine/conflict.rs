use std::collections::HashSet;

use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidSpan);
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapClass {
    Appointment,
    /// A block whose classification excludes the requesting party.
    ReservedBlock,
    UnreservedBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlap {
    pub candidate_id: Ulid,
    pub candidate: Span,
    pub existing: ScheduleEvent,
    pub class: OverlapClass,
    /// The overlap alone rejects the operation.
    pub fatal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Clear,
    /// Overlaps exist but none is fatal.
    Advisory,
    Rejected,
    /// The scan stopped at the overlap cap.
    TooMany,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Clear => "clear",
            Verdict::Advisory => "advisory",
            Verdict::Rejected => "rejected",
            Verdict::TooMany => "too_many",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConflictReport {
    pub overlaps: Vec<Overlap>,
    pub double_booking_allowed: bool,
    pub truncated: bool,
    pub max_overlaps: usize,
}

impl ConflictReport {
    pub fn verdict(&self) -> Verdict {
        if self.overlaps.iter().any(|o| o.fatal) {
            Verdict::Rejected
        } else if self.truncated {
            Verdict::TooMany
        } else if !self.overlaps.is_empty() {
            Verdict::Advisory
        } else {
            Verdict::Clear
        }
    }

    pub fn is_clear(&self) -> bool {
        self.verdict() == Verdict::Clear
    }

    /// Reports that must stop the operation become errors.
    pub fn into_result(self) -> Result<ConflictReport, EngineError> {
        match self.verdict() {
            Verdict::Rejected => {
                let id = self
                    .overlaps
                    .iter()
                    .find(|o| o.fatal)
                    .map_or_else(Ulid::nil, |o| o.existing.id);
                Err(EngineError::Conflict(id))
            }
            Verdict::TooMany => Err(EngineError::TooManyOverlaps(self.max_overlaps)),
            Verdict::Clear | Verdict::Advisory => Ok(self),
        }
    }

    /// Fold another resource's report into this one.
    pub(crate) fn merge(&mut self, other: ConflictReport) {
        self.overlaps.extend(other.overlaps);
        self.double_booking_allowed &= other.double_booking_allowed;
        self.truncated |= other.truncated;
    }
}

/// Check candidates bound for one resource against its existing events.
///
/// Candidates are never compared with themselves or with members of their
/// own series. Blocks may be placed over anything and are not checked.
/// Stops once `max_overlaps` distinct existing events have been collected.
pub fn check_overlaps(
    candidates: &[ScheduleEvent],
    resource: &ResourceState,
    party: Option<&Party>,
    max_overlaps: usize,
) -> ConflictReport {
    let allow = resource.rules.allow_double_booking;
    let mut report = ConflictReport {
        double_booking_allowed: allow,
        max_overlaps,
        ..ConflictReport::default()
    };
    let own_ids: HashSet<Ulid> = candidates.iter().map(|c| c.id).collect();
    let own_series: HashSet<Ulid> = candidates.iter().filter_map(|c| c.series_id).collect();
    let mut seen: HashSet<Ulid> = HashSet::new();

    'candidates: for candidate in candidates.iter().filter(|c| !c.is_blocking()) {
        for existing in resource.overlapping(&candidate.span) {
            if own_ids.contains(&existing.id)
                || existing.series_id.is_some_and(|s| own_series.contains(&s))
            {
                continue;
            }
            if !seen.contains(&existing.id) {
                if seen.len() >= max_overlaps {
                    report.truncated = true;
                    break 'candidates;
                }
                seen.insert(existing.id);
            }
            let class = if !existing.is_blocking() {
                OverlapClass::Appointment
            } else if existing.is_reserved_against(party) {
                OverlapClass::ReservedBlock
            } else {
                OverlapClass::UnreservedBlock
            };
            let fatal = match class {
                OverlapClass::Appointment => !allow,
                OverlapClass::ReservedBlock => true,
                OverlapClass::UnreservedBlock => false,
            };
            report.overlaps.push(Overlap {
                candidate_id: candidate.id,
                candidate: candidate.span,
                existing: existing.clone(),
                class,
                fatal,
            });
        }
    }
    report
}

/// First pair of events in the set that overlap each other.
pub fn first_self_overlap(events: &[ScheduleEvent]) -> Option<(Ulid, Ulid)> {
    let mut sorted: Vec<&ScheduleEvent> = events.iter().filter(|e| !e.is_blocking()).collect();
    sorted.sort_by_key(|e| (e.span.start, e.span.end));
    // The earlier event reaching furthest is the only one that can overlap.
    let mut reach: Option<&ScheduleEvent> = None;
    for event in sorted {
        if let Some(prev) = reach
            && prev.span.end > event.span.start
        {
            return Some((prev.id, event.id));
        }
        if reach.is_none_or(|prev| event.span.end > prev.span.end) {
            reach = Some(event);
        }
    }
    None
}
