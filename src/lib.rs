pub mod config;
pub mod engine;
pub mod grid;
pub mod limits;
pub mod model;
pub mod observability;
pub mod recurrence;
pub mod series;
pub mod wal;
