use std::collections::BTreeSet;

use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use super::*;
use crate::grid::ScheduleGrid;
use crate::recurrence::RecurrenceExpression;
use crate::series::{DeleteScope, Expansion};

const M: Ms = MINUTE_MS;

/// 2030-01-07 is a Monday.
fn at(day: u32, h: u32, m: u32) -> Ms {
    to_ms(
        NaiveDate::from_ymd_opt(2030, 1, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap(),
    )
}

fn open(dir: &TempDir) -> Engine {
    Engine::open(&dir.path().join("test.wal")).unwrap()
}

fn surgery(engine: &Engine, allow_double_booking: bool) -> Ulid {
    let id = Ulid::new();
    engine
        .create_resource(id, Some("Surgery".into()), 480, 1080, 15, allow_double_booking)
        .unwrap();
    id
}

fn appt(resource_id: Ulid, start: Ms, minutes: i64) -> ScheduleEvent {
    ScheduleEvent::appointment(Ulid::new(), resource_id, Span::new(start, start + minutes * M))
}

/// A booked 09:00 anchor on the Monday with a daily rule of five instances.
fn daily_series(engine: &Engine, resource_id: Ulid) -> ScheduleEvent {
    let anchor = appt(resource_id, at(7, 9, 0), 30);
    engine.book(anchor.clone(), None).unwrap();
    let mut series = engine.load_series(anchor.id).unwrap();
    series.set_expression(Some(RecurrenceExpression::daily(anchor.span.start)));
    series.set_max_instances(5).unwrap();
    engine.save_series_at(&mut series, None, at(1, 0, 0)).unwrap().unwrap();
    anchor
}

fn starts(engine: &Engine, series_id: Ulid) -> Vec<Ms> {
    engine
        .series_instances(series_id)
        .iter()
        .map(|e| e.span.start)
        .collect()
}

// ── Resources and bookings ───────────────────────────────

#[test]
fn invalid_rules_are_refused() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let id = Ulid::new();
    assert!(matches!(
        engine.create_resource(id, None, 600, 540, 15, false),
        Err(EngineError::InvalidRules(e)) if e == id
    ));
    assert!(matches!(
        engine.create_resource(id, None, 540, 600, 0, false),
        Err(EngineError::InvalidRules(_))
    ));
    assert_eq!(engine.store().resource_count(), 0);
}

#[test]
fn state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let (resource_id, event) = {
        let engine = open(&dir);
        let resource_id = surgery(&engine, false);
        let event = appt(resource_id, at(7, 9, 0), 30);
        engine.book(event.clone(), None).unwrap();
        (resource_id, event)
    };

    let engine = open(&dir);
    assert_eq!(engine.get_event(event.id).unwrap(), event);
    assert_eq!(engine.list_resources()[0].id, resource_id);
}

#[test]
fn bookings_after_a_crash_survive_the_next_restart() {
    use std::io::Write;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.wal");
    let first = surgery(&open(&dir), false);
    // A crash mid-append leaves half a frame behind.
    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap()
        .write_all(&[0x5A; 6])
        .unwrap();

    let second = {
        let engine = open(&dir);
        assert!(engine.resource(first).is_some());
        surgery(&engine, true)
    };

    let engine = open(&dir);
    assert!(engine.resource(first).is_some());
    assert!(engine.resource(second).is_some());
    assert_eq!(engine.store().resource_count(), 2);
}

#[test]
fn overlapping_booking_rejected_without_double_booking() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let first = appt(resource_id, at(7, 9, 0), 30);
    engine.book(first.clone(), None).unwrap();

    let second = appt(resource_id, at(7, 9, 15), 30);
    assert!(matches!(
        engine.book(second.clone(), None),
        Err(EngineError::Conflict(id)) if id == first.id
    ));
    assert!(engine.get_event(second.id).is_err());

    // Back to back is fine.
    let after = appt(resource_id, at(7, 9, 30), 30);
    assert!(engine.book(after, None).unwrap().is_clear());
}

#[test]
fn double_booking_is_advisory_and_opens_a_virtual_column() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, true);
    engine.book(appt(resource_id, at(7, 9, 0), 30), None).unwrap();
    let report = engine.book(appt(resource_id, at(7, 9, 15), 30), None).unwrap();
    assert_eq!(report.verdict(), Verdict::Advisory);
    assert_eq!(report.overlaps[0].class, OverlapClass::Appointment);

    let date = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
    let grid = engine.day_grid(date, &[resource_id]).unwrap();
    assert_eq!(grid.column_count(), 2);
    assert_eq!(grid.resource_at(1).and_then(|c| c.origin()), Some(0));
}

#[test]
fn moving_an_event_does_not_conflict_with_itself() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let mut event = appt(resource_id, at(7, 9, 0), 30);
    engine.book(event.clone(), None).unwrap();

    event.span = event.span.moved_to(at(7, 9, 15));
    assert!(engine.book(event.clone(), None).unwrap().is_clear());
    assert_eq!(engine.get_event(event.id).unwrap().span.start, at(7, 9, 15));
}

#[test]
fn reserved_blocks_admit_only_their_classifications() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let block = ScheduleEvent::block(
        Ulid::new(),
        resource_id,
        Span::new(at(7, 10, 0), at(7, 11, 0)),
        BTreeSet::from(["VIP".to_string()]),
    );
    assert!(engine.book(block.clone(), None).unwrap().is_clear());

    let regular = Party::new(Ulid::new()).with_classification("STANDARD");
    let vip = Party::new(Ulid::new()).with_classification("VIP");
    assert!(matches!(
        engine.book(appt(resource_id, at(7, 10, 0), 30), Some(&regular)),
        Err(EngineError::Conflict(id)) if id == block.id
    ));
    assert!(matches!(
        engine.book(appt(resource_id, at(7, 10, 0), 30), None),
        Err(EngineError::Conflict(_))
    ));
    let report = engine
        .book(appt(resource_id, at(7, 10, 0), 30), Some(&vip))
        .unwrap();
    assert_eq!(report.overlaps[0].class, OverlapClass::UnreservedBlock);
}

#[test]
fn invalid_spans_and_unknown_resources() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let mut empty = appt(resource_id, at(7, 9, 0), 30);
    empty.span = Span {
        start: at(7, 9, 0),
        end: at(7, 9, 0),
    };
    assert!(matches!(engine.book(empty, None), Err(EngineError::InvalidSpan)));

    let stray = appt(Ulid::new(), at(7, 9, 0), 30);
    assert!(matches!(
        engine.book(stray.clone(), None),
        Err(EngineError::NotFound(id)) if id == stray.resource_id
    ));
}

#[test]
fn cancel_removes_the_event() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let event = appt(resource_id, at(7, 9, 0), 30);
    engine.book(event.clone(), None).unwrap();
    assert_eq!(engine.cancel(event.id).unwrap(), event);
    assert!(matches!(engine.cancel(event.id), Err(EngineError::NotFound(_))));
    assert!(engine.book(appt(resource_id, at(7, 9, 0), 30), None).unwrap().is_clear());
}

// ── Series ───────────────────────────────────────────────

#[test]
fn new_series_expands_from_the_anchor() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let anchor = daily_series(&engine, resource_id);

    let record = engine.series(anchor.id).unwrap();
    assert_eq!(record.expression.as_deref(), Some("0 9 * * *"));
    assert_eq!(record.version, 1);
    assert_eq!(
        starts(&engine, anchor.id),
        vec![at(7, 9, 0), at(8, 9, 0), at(9, 9, 0), at(10, 9, 0), at(11, 9, 0)]
    );
    assert_eq!(engine.get_event(anchor.id).unwrap().series_id, Some(anchor.id));
}

#[test]
fn unchanged_series_saves_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let anchor = daily_series(&engine, resource_id);
    let appends = engine.appends_since_compact();

    let mut series = engine.load_series(anchor.id).unwrap();
    assert!(!series.is_modified());
    assert_eq!(engine.save_series_at(&mut series, None, at(9, 12, 0)).unwrap(), None);
    assert_eq!(engine.appends_since_compact(), appends);
}

#[test]
fn changing_the_rule_keeps_elapsed_instances_and_reuses_future_ones() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let anchor = daily_series(&engine, resource_id);
    let before = engine.series_instances(anchor.id);

    let mut series = engine.load_series(anchor.id).unwrap();
    series.set_expression(Some(RecurrenceExpression::weekly(anchor.span.start)));
    let plan = engine
        .save_series_at(&mut series, None, at(9, 12, 0))
        .unwrap()
        .unwrap();
    assert_eq!(plan.expansion, Some(Expansion::Capped));

    let after = engine.series_instances(anchor.id);
    // Anchor plus the Tuesday and Wednesday that already happened stay put.
    assert_eq!(&after[..3], &before[..3]);
    // Thursday and Friday moved to the following Mondays, same records.
    assert_eq!(
        after[3..].iter().map(|e| (e.id, e.span.start)).collect::<Vec<_>>(),
        vec![(before[3].id, at(14, 9, 0)), (before[4].id, at(21, 9, 0))]
    );
    assert_eq!(engine.series(anchor.id).unwrap().version, 2);
}

#[test]
fn series_conflicts_write_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let other = appt(resource_id, at(9, 9, 0), 30);
    engine.book(other.clone(), None).unwrap();
    let anchor = appt(resource_id, at(7, 9, 0), 30);
    engine.book(anchor.clone(), None).unwrap();

    let mut series = engine.load_series(anchor.id).unwrap();
    series.set_expression(Some(RecurrenceExpression::daily(anchor.span.start)));
    series.set_max_instances(5).unwrap();
    assert!(matches!(
        engine.save_series_at(&mut series, None, at(1, 0, 0)),
        Err(EngineError::Conflict(id)) if id == other.id
    ));
    assert!(engine.series(anchor.id).is_none());
    assert_eq!(engine.get_event(anchor.id).unwrap().series_id, None);
}

#[test]
fn a_booking_racing_a_series_save_cannot_slip_under_it() {
    use std::sync::mpsc;
    use std::time::Duration;

    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let room = surgery(&engine, false);
    let anchor = appt(room, at(7, 9, 0), 30);
    engine.book(anchor.clone(), None).unwrap();
    let mut series = engine.load_series(anchor.id).unwrap();
    series.set_expression(Some(RecurrenceExpression::daily(anchor.span.start)));
    series.set_max_instances(3).unwrap();
    // Wednesday's instance lands on this.
    let rival = appt(room, at(9, 9, 10), 20);

    let (checked, go) = mpsc::channel();
    let (saved, booked) = std::thread::scope(|s| {
        let engine = &engine;
        let contender = rival.clone();
        let racer = s.spawn(move || {
            go.recv().unwrap();
            engine.book(contender, None)
        });
        let saved = series.save_checked(engine, engine.evaluator(), at(1, 0, 0), 1, |plan| {
            engine.check_overlaps(&plan.candidates, None)?.into_result()?;
            checked.send(()).unwrap();
            // Give the booking every chance to run before the commit.
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        });
        (saved, racer.join().unwrap())
    });

    assert!(saved.unwrap().is_some());
    assert_eq!(starts(&engine, anchor.id), vec![at(7, 9, 0), at(8, 9, 0), at(9, 9, 0)]);
    assert!(matches!(booked, Err(EngineError::Conflict(_))));
    assert_eq!(engine.get_event(rival.id).ok(), None);
}

#[test]
fn instances_overlapping_each_other_are_refused() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, true);
    // Two days long, repeating daily.
    let anchor = appt(resource_id, at(7, 9, 0), 48 * 60);
    engine.book(anchor.clone(), None).unwrap();

    let mut series = engine.load_series(anchor.id).unwrap();
    series.set_expression(Some(RecurrenceExpression::daily(anchor.span.start)));
    series.set_max_instances(3).unwrap();
    assert!(matches!(
        engine.save_series_at(&mut series, None, at(1, 0, 0)),
        Err(EngineError::SeriesOverlap(a, _)) if a == anchor.id
    ));
    assert!(engine.series(anchor.id).is_none());
}

#[test]
fn clearing_a_series_without_history_deletes_it() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let anchor = daily_series(&engine, resource_id);

    let mut series = engine.load_series(anchor.id).unwrap();
    series.set_expression(None);
    let plan = engine
        .save_series_at(&mut series, None, at(1, 0, 0))
        .unwrap()
        .unwrap();
    assert_eq!(plan.expansion, None);
    assert!(engine.series(anchor.id).is_none());
    assert_eq!(engine.get_event(anchor.id).unwrap().series_id, None);
    let week = Span::new(at(7, 0, 0), at(14, 0, 0));
    assert_eq!(engine.events_in(resource_id, &week).unwrap().len(), 1);
    engine.cancel(anchor.id).unwrap();
}

#[test]
fn clearing_a_series_with_history_keeps_the_record() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let anchor = daily_series(&engine, resource_id);

    let mut series = engine.load_series(anchor.id).unwrap();
    series.set_expression(None);
    engine.save_series_at(&mut series, None, at(8, 12, 0)).unwrap();

    let record = engine.series(anchor.id).unwrap();
    assert_eq!(record.expression, None);
    assert_eq!(record.version, 2);
    assert_eq!(starts(&engine, anchor.id), vec![at(7, 9, 0), at(8, 9, 0)]);

    let reloaded = engine.load_series(anchor.id).unwrap();
    assert!(!reloaded.is_modified());

    let kept = reloaded.instances()[0].id;
    engine.cancel(anchor.id).unwrap();
    let record = engine.series(anchor.id).unwrap();
    assert_eq!(record.anchor_id, kept);
    assert_eq!(starts(&engine, anchor.id), vec![at(8, 9, 0)]);

    engine.cancel(kept).unwrap();
    assert!(engine.series(anchor.id).is_none());
    assert!(engine.get_event(kept).is_err());
}

#[test]
fn cancelling_the_anchor_hands_the_series_to_the_next_instance() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let anchor = daily_series(&engine, resource_id);

    engine.cancel(anchor.id).unwrap();
    assert!(engine.get_event(anchor.id).is_err());
    let record = engine.series(anchor.id).unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.start_time, at(8, 9, 0));
    assert_eq!(record.expression.as_deref(), Some("0 9 * * *"));

    let series = engine.load_series(record.anchor_id).unwrap();
    assert_eq!(series.anchor().span.start, at(8, 9, 0));
    assert_eq!(series.instances().len(), 3);
    assert!(!series.is_modified());
}

#[test]
fn cancelling_from_an_instance_stops_the_series_there() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let anchor = daily_series(&engine, resource_id);
    let third = engine.load_series(anchor.id).unwrap().instances()[1].id;

    let plan = engine.cancel_series(third, DeleteScope::Following).unwrap();
    assert_eq!(plan.members.len(), 2);
    assert_eq!(starts(&engine, anchor.id), vec![at(7, 9, 0), at(8, 9, 0)]);
    let record = engine.series(anchor.id).unwrap();
    assert_eq!(record.expression, None);
    assert_eq!(record.anchor_id, anchor.id);
    assert!(engine.events_in(resource_id, &Span::new(at(9, 0, 0), at(12, 0, 0))).unwrap().is_empty());
}

#[test]
fn cancelling_the_whole_series_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.wal");
    let resource_id;
    let anchor;
    {
        let engine = Engine::open(&path).unwrap();
        resource_id = surgery(&engine, false);
        anchor = daily_series(&engine, resource_id);
        let last = engine.load_series(anchor.id).unwrap().instances()[3].id;

        let plan = engine.cancel_series(last, DeleteScope::All).unwrap();
        assert!(plan.members.is_empty());
        assert!(matches!(plan.batch.mutations[0], Mutation::SeriesDeleted { .. }));
    }

    let engine = Engine::open(&path).unwrap();
    assert!(engine.series(anchor.id).is_none());
    assert!(engine.series_instances(anchor.id).is_empty());
    assert!(engine.events_in(resource_id, &Span::new(at(7, 0, 0), at(12, 0, 0))).unwrap().is_empty());
    assert!(matches!(engine.cancel_series(anchor.id, DeleteScope::All), Err(EngineError::NotFound(_))));
}

#[test]
fn series_deletes_need_a_series() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let lone = appt(resource_id, at(7, 9, 0), 30);
    engine.book(lone.clone(), None).unwrap();
    assert!(matches!(
        engine.cancel_series(lone.id, DeleteScope::One),
        Err(EngineError::NotInSeries(_))
    ));
    assert!(engine.get_event(lone.id).is_ok());
}

#[test]
fn stale_save_is_recomputed_from_fresh_state() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let anchor = daily_series(&engine, resource_id);

    let mut first = engine.load_series(anchor.id).unwrap();
    let mut second = engine.load_series(anchor.id).unwrap();

    first.set_expression(Some(RecurrenceExpression::weekly(anchor.span.start)));
    engine.save_series_at(&mut first, None, at(1, 0, 0)).unwrap().unwrap();

    // Still holding version 1; the save retries against version 2.
    second.set_max_instances(3).unwrap();
    engine.save_series_at(&mut second, None, at(1, 0, 0)).unwrap().unwrap();

    let record = engine.series(anchor.id).unwrap();
    assert_eq!(record.version, 3);
    assert_eq!(record.max_instances, 3);
    assert_eq!(record.expression.as_deref(), Some("0 9 * * *"));
    assert_eq!(starts(&engine, anchor.id), vec![at(7, 9, 0), at(8, 9, 0), at(9, 9, 0)]);
}

#[test]
fn series_survive_compaction_and_reopen() {
    let dir = TempDir::new().unwrap();
    let (anchor, before) = {
        let engine = open(&dir);
        let resource_id = surgery(&engine, false);
        let anchor = daily_series(&engine, resource_id);
        engine.compact().unwrap();
        assert_eq!(engine.appends_since_compact(), 0);
        let before = engine.series_instances(anchor.id);
        (anchor, before)
    };

    let engine = open(&dir);
    assert_eq!(engine.series_instances(anchor.id), before);
    assert_eq!(engine.series(anchor.id).unwrap().version, 1);
    let series = engine.load_series(anchor.id).unwrap();
    assert_eq!(series.instances().len(), 4);
    assert!(!series.is_modified());
}

// ── Grids ────────────────────────────────────────────────

#[test]
fn grid_queries_validate_their_input() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let date = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();

    assert!(matches!(
        engine.days_grid(date, 0, &[resource_id]),
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.days_grid(date, 367, &[resource_id]),
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(engine.day_grid(date, &[Ulid::new()]), Err(EngineError::NotFound(_))));
    assert!(engine.single_grid(date, resource_id).is_ok());
}

#[test]
fn week_grid_shows_a_series_one_cell_per_day() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let resource_id = surgery(&engine, false);
    let anchor = daily_series(&engine, resource_id);

    let date = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
    let grid = engine.days_grid(date, 7, &[resource_id]).unwrap();
    assert_eq!(grid.slot_count(), 7);
    let occupied: Vec<bool> = (0..7).map(|slot| grid.event_at(0, slot).is_some()).collect();
    assert_eq!(occupied, vec![true, true, true, true, true, false, false]);
    assert_eq!(grid.event_at(0, 0).map(|e| e.id), Some(anchor.id));
}
