use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use vetslot::config::Config;
use vetslot::engine::Engine;
use vetslot::grid::{
    Availability, GridFrame, MultiDayGrid, MultiScheduleGrid, ScheduleGrid, SingleScheduleGrid,
};
use vetslot::model::{Ms, ResourceRules, ScheduleEvent, to_datetime, to_ms};
use vetslot::recurrence::{CronEvaluator, RecurrenceExpression, StandardCron};

#[derive(Parser, Debug)]
#[command(author, version, about = "Appointment grids and recurring series", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lay out a JSON sheet of resources and events as a grid.
    Grid {
        sheet: PathBuf,
        #[arg(short, long)]
        date: NaiveDate,
        /// Lay out whole days instead of slots.
        #[arg(long)]
        days: Option<u32>,
        /// Only the first resource, as stacked slots.
        #[arg(long)]
        single: bool,
    },
    /// Show the kind and canonical text of a recurrence rule.
    Classify { expression: String },
    /// List the next valid times of a recurrence rule.
    Next {
        expression: String,
        /// Start searching strictly after this time, e.g. 2024-03-04T09:00:00.
        #[arg(short, long)]
        after: NaiveDateTime,
        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },
    /// Load a JSON sheet into the data directory.
    Import { sheet: PathBuf },
    /// Set or clear the recurrence of a stored event.
    Series {
        event: Ulid,
        /// Omit to clear the recurrence.
        #[arg(short, long)]
        expression: Option<String>,
        #[arg(long)]
        max_instances: Option<u32>,
        #[arg(long)]
        until: Option<NaiveDateTime>,
    },
    /// Rewrite the log in the data directory.
    Compact,
}

/// Input sheet for `grid` and `import`.
#[derive(Debug, Deserialize)]
struct Sheet {
    resources: Vec<ResourceRules>,
    #[serde(default)]
    events: Vec<ScheduleEvent>,
}

#[derive(Debug, Serialize)]
struct ColumnView {
    resource_id: Ulid,
    name: Option<String>,
    origin: Option<usize>,
}

#[derive(Debug, Serialize)]
struct CellView {
    availability: Availability,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<Ulid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RowView {
    start: Option<NaiveDateTime>,
    cells: Vec<CellView>,
}

#[derive(Debug, Serialize)]
struct GridView {
    frame: GridFrame,
    columns: Vec<ColumnView>,
    rows: Vec<RowView>,
}

fn render(grid: &impl ScheduleGrid) -> GridView {
    let columns = (0..grid.column_count())
        .filter_map(|col| grid.resource_at(col))
        .map(|schedule| ColumnView {
            resource_id: schedule.resource_id(),
            name: schedule.rules().name.clone(),
            origin: schedule.origin(),
        })
        .collect();
    let rows = (0..grid.slot_count())
        .map(|slot| RowView {
            start: grid.slot_start(slot).map(to_datetime),
            cells: (0..grid.column_count())
                .map(|col| {
                    let event = grid.event_at(col, slot);
                    CellView {
                        availability: grid.availability_at(col, slot),
                        event: event.map(|e| e.id),
                        rows: event.map(|e| grid.slots_occupied_by(e, col, slot)),
                    }
                })
                .collect(),
        })
        .collect();
    GridView {
        frame: grid.frame(),
        columns,
        rows,
    }
}

/// Resources and spans are validated while parsing, so a bad sheet is an
/// error here rather than a panic inside a grid.
fn read_sheet(path: &Path) -> Result<Sheet, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| format!("{}: {e}", path.display()).into())
}

fn print_json(value: &impl Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    match args.command {
        Command::Grid {
            sheet,
            date,
            days,
            single,
        } => {
            let sheet = read_sheet(&sheet)?;
            let view = if single {
                let rules = sheet
                    .resources
                    .into_iter()
                    .next()
                    .ok_or("sheet has no resources")?;
                render(&SingleScheduleGrid::new(date, rules, sheet.events)?)
            } else if let Some(days) = days {
                render(&MultiDayGrid::build(date, days, &sheet.resources, sheet.events))
            } else {
                render(&MultiScheduleGrid::build(date, &sheet.resources, sheet.events))
            };
            print_json(&view)?;
        }
        Command::Classify { expression } => {
            let expr: RecurrenceExpression = expression.parse()?;
            println!("{:?}\t{}", expr.classify(), expr);
        }
        Command::Next {
            expression,
            after,
            count,
        } => {
            let expr: RecurrenceExpression = expression.parse()?;
            let text = expr.to_cron_text();
            let mut at: Ms = to_ms(after);
            for _ in 0..count {
                let Some(next) = StandardCron.next_valid_time(&text, at) else {
                    break;
                };
                println!("{}", to_datetime(next));
                at = next;
            }
        }
        Command::Import { sheet } => {
            let sheet = read_sheet(&sheet)?;
            let engine = Engine::with_config(Config::from_env())?;
            for rules in sheet.resources {
                engine.create_resource(
                    rules.id,
                    rules.name,
                    rules.start_mins,
                    rules.end_mins,
                    rules.slot_size,
                    rules.allow_double_booking,
                )?;
            }
            let mut advisories = 0;
            for event in sheet.events {
                advisories += engine.book(event, None)?.overlaps.len();
            }
            info!(resources = engine.store().resource_count(), advisories, "sheet imported");
        }
        Command::Series {
            event,
            expression,
            max_instances,
            until,
        } => {
            let engine = Engine::with_config(Config::from_env())?;
            let mut series = engine.load_series(event)?;
            series.set_expression(expression.as_deref().map(RecurrenceExpression::parse).transpose()?);
            if let Some(max) = max_instances {
                series.set_max_instances(max)?;
            }
            if until.is_some() {
                series.set_until(until.map(to_ms));
            }
            match engine.save_series(&mut series, None)? {
                Some(plan) => {
                    println!(
                        "series {}: {} mutations, {} instances, expansion {:?}",
                        plan.series_id,
                        plan.batch.len(),
                        plan.members.len(),
                        plan.expansion,
                    );
                }
                None => println!("series unchanged"),
            }
        }
        Command::Compact => {
            let engine = Engine::with_config(Config::from_env())?;
            engine.compact()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vetslot::model::Span;

    fn sheet_file(dir: &TempDir, resources: &str, events: &str) -> PathBuf {
        let path = dir.path().join("sheet.json");
        std::fs::write(&path, format!(r#"{{"resources":[{resources}],"events":[{events}]}}"#)).unwrap();
        path
    }

    fn resource_json(id: Ulid, slot_size: u32) -> String {
        format!(r#"{{"id":"{id}","name":"Kennel","start_mins":480,"end_mins":1080,"slot_size":{slot_size}}}"#)
    }

    #[test]
    fn sheet_with_zero_slot_size_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = sheet_file(&dir, &resource_json(Ulid::new(), 0), "");
        let err = read_sheet(&path).unwrap_err();
        assert!(err.to_string().contains("invalid rules"), "{err}");
    }

    #[test]
    fn sheet_with_empty_event_span_is_an_error() {
        let dir = TempDir::new().unwrap();
        let id = Ulid::new();
        let event = ScheduleEvent::appointment(Ulid::new(), id, Span::new(1_000, 2_000));
        let text = serde_json::to_string(&event)
            .unwrap()
            .replace(r#""end":2000"#, r#""end":1000"#);
        let path = sheet_file(&dir, &resource_json(id, 15), &text);
        let err = read_sheet(&path).unwrap_err();
        assert!(err.to_string().contains("positive length"), "{err}");
    }

    #[test]
    fn valid_sheet_renders_a_grid() {
        let dir = TempDir::new().unwrap();
        let path = sheet_file(&dir, &resource_json(Ulid::new(), 30), "");
        let sheet = read_sheet(&path).unwrap();
        let date = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        let view = render(&MultiScheduleGrid::build(date, &sheet.resources, sheet.events));
        assert_eq!(view.columns.len(), 1);
        assert_eq!(view.rows.len(), 20);
    }
}

